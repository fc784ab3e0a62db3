//! Broker link driver.
//!
//! A [`BrokerLink`] owns the rumqttc event loop of one connection and walks
//! through its phases with compile-time checked transitions:
//!
//! ```text
//! Connecting ──establish──► Connected ──pump──► Reconnecting ──backoff──► Connecting
//!      └─────────────────────────┴───────────────────┴──────────► Closed
//! ```

use std::sync::Arc;

use rumqttc::{ConnectReturnCode, Event, EventLoop, Packet};
use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionState;
use super::message::{BrokerEvent, BrokerMessage};
use super::reconnect::ReconnectPolicy;

#[state]
#[derive(Debug, Clone)]
pub enum LinkPhase {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[machine]
pub struct BrokerLink<S: LinkPhase> {
    eventloop: EventLoop,
    events: mpsc::Sender<BrokerEvent>,
    status: Arc<watch::Sender<ConnectionState>>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    broker: String,
    // consecutive failures since the last ConnAck
    attempt: u32,
}

/// Why a connecting or connected link stopped.
pub enum Interrupted {
    Dropped(BrokerLink<Reconnecting>),
    Closed(BrokerLink<Closed>),
}

impl<S: LinkPhase> BrokerLink<S> {
    fn report(&self, state: ConnectionState) {
        self.status.send_replace(state);
    }
}

/// Hands `event` to the session. False once the link should stop.
// EventLoop is not Sync; never hold `&BrokerLink` across an await.
async fn forward(
    cancel: &CancellationToken,
    events: &mpsc::Sender<BrokerEvent>,
    event: BrokerEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

impl BrokerLink<Connecting> {
    pub fn create(
        eventloop: EventLoop,
        events: mpsc::Sender<BrokerEvent>,
        status: Arc<watch::Sender<ConnectionState>>,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
        broker: String,
    ) -> Self {
        Self::new(eventloop, events, status, policy, cancel, broker, 0)
    }

    /// Polls until the broker acknowledges the connection.
    pub async fn establish(mut self) -> Result<BrokerLink<Connected>, Interrupted> {
        debug!("Connecting to {}", self.broker);
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => None,
                polled = self.eventloop.poll() => Some(polled),
            };

            match polled {
                None => return Err(Interrupted::Closed(self.transition())),
                Some(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!("Broker {} refused connection: {:?}", self.broker, ack.code);
                        return Err(Interrupted::Dropped(self.transition()));
                    }
                    info!("Connected to {}", self.broker);
                    self.attempt = 0;
                    self.report(ConnectionState::Connected);
                    if !forward(&self.cancel, &self.events, BrokerEvent::Connected).await {
                        return Err(Interrupted::Closed(self.transition()));
                    }
                    return Ok(self.transition());
                }
                Some(Ok(event)) => debug!("Event before ConnAck: {:?}", event),
                Some(Err(e)) => {
                    warn!("Connection to {} failed: {}", self.broker, e);
                    return Err(Interrupted::Dropped(self.transition()));
                }
            }
        }
    }
}

impl BrokerLink<Connected> {
    /// Forwards inbound publishes, in arrival order, until the link drops.
    pub async fn pump(mut self) -> Interrupted {
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => None,
                polled = self.eventloop.poll() => Some(polled),
            };

            match polled {
                None => return Interrupted::Closed(self.transition()),
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    let message = BrokerMessage::from_topic(publish.topic, payload);
                    debug!("Received {}", message);
                    if !forward(&self.cancel, &self.events, BrokerEvent::Message(message)).await {
                        return Interrupted::Closed(self.transition());
                    }
                }
                Some(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("Broker {} sent disconnect", self.broker);
                    return self.dropped().await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection to {} lost: {}", self.broker, e);
                    return self.dropped().await;
                }
            }
        }
    }

    async fn dropped(self) -> Interrupted {
        self.report(ConnectionState::Disconnected);
        if !forward(&self.cancel, &self.events, BrokerEvent::Disconnected).await {
            return Interrupted::Closed(self.transition());
        }
        Interrupted::Dropped(self.transition())
    }
}

impl BrokerLink<Reconnecting> {
    /// Waits out the retry delay, or gives up once the policy is exhausted.
    pub async fn backoff(mut self) -> Result<BrokerLink<Connecting>, BrokerLink<Closed>> {
        self.attempt += 1;
        if !self.policy.allows(self.attempt) {
            error!(
                "Giving up on {} after {} failed attempts",
                self.broker,
                self.attempt - 1
            );
            self.report(ConnectionState::Failed);
            return Err(self.transition());
        }

        let delay = self.policy.delay(self.attempt);
        info!(
            "Reconnecting to {} in {:?} (attempt {})",
            self.broker, delay, self.attempt
        );
        self.report(ConnectionState::Reconnecting);
        let cancelled = tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        if cancelled {
            return Err(self.transition());
        }
        self.report(ConnectionState::Connecting);
        Ok(self.transition())
    }
}

impl BrokerLink<Closed> {
    pub fn finish(self) {
        if *self.status.borrow() != ConnectionState::Failed {
            self.report(ConnectionState::Disconnected);
        }
        info!("Broker link to {} closed", self.broker);
    }
}

/// Runs a link until it is cancelled or its reconnect policy gives up.
pub async fn drive(link: BrokerLink<Connecting>) {
    let mut connecting = link;
    let closed = loop {
        let interrupted = match connecting.establish().await {
            Ok(connected) => connected.pump().await,
            Err(interrupted) => interrupted,
        };
        match interrupted {
            Interrupted::Closed(closed) => break closed,
            Interrupted::Dropped(reconnecting) => match reconnecting.backoff().await {
                Ok(next) => connecting = next,
                Err(closed) => break closed,
            },
        }
    };
    closed.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{BrokerSettings, MqttConfig};
    use crate::testing::credentials;
    use rumqttc::AsyncClient;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Running {
        // the event loop ends early once every client is dropped
        _client: AsyncClient,
        task: JoinHandle<()>,
        state: watch::Receiver<ConnectionState>,
        events: mpsc::Receiver<BrokerEvent>,
        cancel: CancellationToken,
    }

    /// Drives a link towards a port nothing listens on.
    fn drive_unreachable(policy: ReconnectPolicy) -> Running {
        let settings = BrokerSettings {
            reconnect: policy,
            ..BrokerSettings::default()
        };
        let mut credentials = credentials("127.0.0.1");
        credentials.websocket_port = 1;
        let config = MqttConfig::from_credentials(&credentials, &settings);

        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        let (events_tx, events) = mpsc::channel(8);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let link = BrokerLink::create(
            eventloop,
            events_tx,
            Arc::new(state_tx),
            config.reconnect.clone(),
            cancel.clone(),
            config.broker_url.clone(),
        );
        Running {
            _client: client,
            task: tokio::spawn(drive(link)),
            state,
            events,
            cancel,
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut running = drive_unreachable(ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 10,
            max_delay_ms: 20,
            max_attempts: Some(2),
        });

        tokio::time::timeout(Duration::from_secs(5), &mut running.task)
            .await
            .expect("link kept retrying")
            .unwrap();

        assert_eq!(*running.state.borrow(), ConnectionState::Failed);
        assert!(running.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_policy_fails_on_first_error() {
        let mut running = drive_unreachable(ReconnectPolicy::disabled());

        tokio::time::timeout(Duration::from_secs(5), &mut running.task)
            .await
            .expect("link kept retrying")
            .unwrap();

        assert_eq!(*running.state.borrow(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn cancel_during_backoff_ends_disconnected() {
        let mut running = drive_unreachable(ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 10_000,
            max_delay_ms: 10_000,
            max_attempts: None,
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            running
                .state
                .wait_for(|state| *state == ConnectionState::Reconnecting),
        )
        .await
        .expect("link never started backing off")
        .unwrap();

        running.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), &mut running.task)
            .await
            .expect("link ignored cancellation")
            .unwrap();

        assert_eq!(*running.state.borrow(), ConnectionState::Disconnected);
    }
}
