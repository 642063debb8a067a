//! Notification handling for the subscribed characteristic
//! This module frames raw value updates and publishes them to subscribers

use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::platform::GattCharacteristic;

/// Re-frames a raw value update: one reserved byte, one length byte
/// (truncated to `u8`), then the payload.
pub fn frame_notification(data: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(data.len() + 2);
    framed.push(0);
    framed.push(data.len() as u8);
    framed.extend_from_slice(data);
    framed
}

/// Live value-changed hook on a characteristic. Unhooking stops the
/// forwarding task and drops the platform receiver.
pub struct Subscription {
    cancel_token: CancellationToken,
    task_handle: JoinHandle<()>,
}

impl Subscription {
    pub async fn unhook(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task_handle.await {
            if !e.is_cancelled() {
                error!("Notification task finished with an unexpected join error: {:?}", e);
            }
        }
    }
}

/// Notification handler for the measurement characteristic
#[derive(Clone)]
pub struct NotificationHandler {
    data_tx: broadcast::Sender<Vec<u8>>,
}

impl NotificationHandler {
    /// Create a new NotificationHandler publishing to `data_tx`
    pub fn new(data_tx: broadcast::Sender<Vec<u8>>) -> Self {
        Self { data_tx }
    }

    /// Attach the value-changed callback. Must only be called once the
    /// client configuration write has succeeded.
    pub async fn attach(&self, characteristic: Arc<dyn GattCharacteristic>) -> Option<Subscription> {
        let mut values = match characteristic.value_changed().await {
            Ok(values) => values,
            Err(status) => {
                error!("Failed to hook value changes: {}", status);
                return None;
            }
        };

        info!("Listening for notifications on {}", characteristic.uuid());
        let cancel_token = CancellationToken::new();
        let cancel_token_for_task = cancel_token.clone();
        let data_tx = self.data_tx.clone();

        let task_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    value = values.recv() => {
                        let Some(value) = value else {
                            info!("Notification stream ended");
                            break;
                        };
                        debug!("Received value: {:?}", value);
                        // No receivers is not an error
                        let _ = data_tx.send(frame_notification(&value));
                    }
                    _ = cancel_token_for_task.cancelled() => {
                        break;
                    }
                }
            }
        });

        Some(Subscription { cancel_token, task_handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::MockService;
    use uuid::Uuid;

    #[test]
    fn frames_with_reserved_and_length_bytes() {
        assert_eq!(frame_notification(&[0x01, 0x02, 0x03]), vec![0x00, 0x03, 0x01, 0x02, 0x03]);
        assert_eq!(frame_notification(&[]), vec![0x00, 0x00]);
    }

    #[test]
    fn length_byte_truncates() {
        let payload = vec![0xAB; 300];
        let framed = frame_notification(&payload);
        assert_eq!(framed.len(), 302);
        assert_eq!(framed[1], (300 % 256) as u8);
        assert_eq!(&framed[2..], payload.as_slice());
    }

    #[tokio::test]
    async fn publishes_framed_values_until_unhooked() {
        let service = MockService::new(Uuid::from_u128(1));
        let characteristic = service.add_notify_characteristic(Uuid::from_u128(2));
        let (data_tx, mut data_rx) = broadcast::channel(16);
        let handler = NotificationHandler::new(data_tx);

        let subscription = handler.attach(characteristic.clone()).await.expect("hooked");
        characteristic.push_value(&[0x10, 0x20]);
        assert_eq!(data_rx.recv().await.unwrap(), vec![0x00, 0x02, 0x10, 0x20]);

        subscription.unhook().await;
        assert_eq!(characteristic.live_value_hooks(), 0);
    }
}
