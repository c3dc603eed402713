//! Push notifications sent after a booking transition commits.
//!
//! Delivery is best-effort: the engine logs a failed [`Notifier::notify`] and
//! moves on, the committed state is never affected.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::model::{BookingId, UserId};

const DRIVER_DASHBOARD: &str = "/dashboard?tab=created";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BookingConfirmation,
    RideActivated,
    BookingCancelled,
}

impl Event {
    pub fn name(self) -> &'static str {
        match self {
            Event::BookingConfirmation => "booking_confirmation",
            Event::RideActivated => "ride_activated",
            Event::BookingCancelled => "booking_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user: UserId,
    pub title: String,
    pub body: String,
    pub event: Event,
    pub redirect_url: Option<String>,
    pub booking: BookingId,
}

impl Notification {
    /// Tell the driver a rider took a seat.
    pub fn booking_confirmed(driver: UserId, booking: BookingId, rider_name: &str) -> Self {
        Self {
            user: driver,
            title: "Ride Booked Successfully!".to_string(),
            body: format!(
                "{} has booked your ride. Get ready for the journey!",
                display_name(rider_name, "A passenger")
            ),
            event: Event::BookingConfirmation,
            redirect_url: Some(DRIVER_DASHBOARD.to_string()),
            booking,
        }
    }

    /// Tell the driver the rider is waiting at the pickup point.
    pub fn rider_arrived(driver: UserId, booking: BookingId, rider_name: &str) -> Self {
        Self {
            user: driver,
            title: "Rider Arrived!".to_string(),
            body: format!(
                "{} is at the starting point! Time to kick off the journey!",
                display_name(rider_name, "Rider")
            ),
            event: Event::RideActivated,
            redirect_url: Some(DRIVER_DASHBOARD.to_string()),
            booking,
        }
    }

    /// Tell the driver a rider gave up their seat.
    pub fn booking_cancelled(driver: UserId, booking: BookingId, rider_name: &str) -> Self {
        Self {
            user: driver,
            title: "Booking Cancelled".to_string(),
            body: format!(
                "{} has cancelled their booking. Check your ride details!",
                display_name(rider_name, "A rider")
            ),
            event: Event::BookingCancelled,
            redirect_url: Some(DRIVER_DASHBOARD.to_string()),
            booking,
        }
    }
}

fn display_name<'a>(name: &'a str, fallback: &'a str) -> &'a str {
    if name.trim().is_empty() { fallback } else { name }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel is closed")]
    Closed,

    #[error("notification channel is full")]
    Full,

    #[error("notification rejected: {0}")]
    Rejected(String),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes every notification to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            user = notification.user,
            booking = notification.booking,
            event = notification.event.name(),
            title = %notification.title,
            "notification sent"
        );
        Ok(())
    }
}

/// Hands notifications to a bounded tokio channel without waiting.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// A notifier plus the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::Full,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_fall_back_to_generic_names() {
        let named = Notification::booking_confirmed(2, 9, "Asha");
        assert_eq!(named.user, 2);
        assert_eq!(
            named.body,
            "Asha has booked your ride. Get ready for the journey!"
        );
        assert_eq!(named.event.name(), "booking_confirmation");

        let anonymous = Notification::booking_cancelled(2, 9, " ");
        assert!(anonymous.body.starts_with("A rider has cancelled"));
        assert_eq!(anonymous.redirect_url.as_deref(), Some("/dashboard?tab=created"));
    }

    #[test]
    fn channel_notifier_delivers_until_full_or_closed() {
        let (notifier, mut rx) = ChannelNotifier::channel(1);
        notifier
            .notify(Notification::rider_arrived(2, 1, "Asha"))
            .unwrap();
        assert!(matches!(
            notifier.notify(Notification::rider_arrived(2, 1, "Asha")),
            Err(NotifyError::Full)
        ));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.title, "Rider Arrived!");

        drop(rx);
        assert!(matches!(
            notifier.notify(Notification::rider_arrived(2, 1, "Asha")),
            Err(NotifyError::Closed)
        ));
    }
}
