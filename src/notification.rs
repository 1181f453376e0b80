use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::domain::{GameInfo, GameOutcome, Side};
use crate::error::ConnectionErrorKind;

/// Everything observers learn from the coordinator, in the order the
/// coordinator applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    GameStarted(GameInfo),
    MoveApplied {
        uci: String,
        san: String,
        mover: Side,
        sequence: u32,
    },
    Check {
        side: Side,
    },
    GameOver(GameOutcome),
    ClockTick {
        side: Side,
        remaining: Duration,
    },
    DrawOffered {
        by: Side,
    },
    ChatReceived {
        from: String,
        text: String,
    },
    ConnectionError(ConnectionErrorKind),
    /// Local history was rebuilt from the server's move list.
    Resynchronized {
        ply: u32,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::GameStarted(info) => {
                write!(f, "game started: {} vs {}", info.white.name, info.black.name)?;
                if let Some(side) = info.user_side {
                    write!(f, ", you play {side}")?;
                }
                Ok(())
            }
            Notification::MoveApplied {
                san,
                mover,
                sequence,
                ..
            } => write!(f, "{sequence}. {mover} played {san}"),
            Notification::Check { side } => write!(f, "{side} is in check"),
            Notification::GameOver(outcome) => write!(f, "game over: {outcome}"),
            Notification::ClockTick { side, remaining } => {
                let secs = remaining.as_secs();
                write!(f, "{side} clock {}:{:02}", secs / 60, secs % 60)
            }
            Notification::DrawOffered { by } => write!(f, "{by} offers a draw"),
            Notification::ChatReceived { from, text } => write!(f, "{from}: {text}"),
            Notification::ConnectionError(kind) => write!(f, "connection error: {kind}"),
            Notification::Resynchronized { ply } => {
                write!(f, "resynchronized with the server at ply {ply}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Subscribers in registration order. Each gets every notification through
/// its own channel; closed channels are pruned on the next dispatch.
#[derive(Debug, Default)]
pub struct Observers {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<Notification>)>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Subscription {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, notifications) = mpsc::unbounded_channel();
        self.subscribers.push((id, tx));
        Subscription { id, notifications }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn notify(&mut self, notification: Notification) {
        tracing::debug!(%notification, "notify");
        self.subscribers.retain(|(id, tx)| {
            let delivered = tx.send(notification.clone()).is_ok();
            if !delivered {
                tracing::debug!(?id, "dropping closed subscriber");
            }
            delivered
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Termination;

    #[test]
    fn every_subscriber_sees_notifications_in_order() {
        let mut observers = Observers::new();
        let mut first = observers.subscribe();
        let mut second = observers.subscribe();

        observers.notify(Notification::Check { side: Side::Black });
        observers.notify(Notification::GameOver(GameOutcome::decisive(
            Side::White,
            Termination::Checkmate,
        )));

        for subscription in [&mut first, &mut second] {
            assert_eq!(
                subscription.notifications.try_recv().unwrap(),
                Notification::Check { side: Side::Black }
            );
            assert!(matches!(
                subscription.notifications.try_recv().unwrap(),
                Notification::GameOver(_)
            ));
            assert!(subscription.notifications.try_recv().is_err());
        }
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut observers = Observers::new();
        let mut kept = observers.subscribe();
        let mut removed = observers.subscribe();

        assert!(observers.unsubscribe(removed.id));
        assert!(!observers.unsubscribe(removed.id));
        observers.notify(Notification::DrawOffered { by: Side::White });

        assert!(kept.notifications.try_recv().is_ok());
        assert!(removed.notifications.try_recv().is_err());
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut observers = Observers::new();
        let dropped = observers.subscribe();
        drop(dropped);

        observers.notify(Notification::Resynchronized { ply: 4 });
        assert!(observers.is_empty());
    }

    #[test]
    fn clock_ticks_render_as_minutes_and_seconds() {
        let tick = Notification::ClockTick {
            side: Side::White,
            remaining: Duration::from_millis(125_900),
        };
        assert_eq!(tick.to_string(), "white clock 2:05");
    }
}
