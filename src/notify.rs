use crate::activity::SharedActivityLog;
use crate::contacts::EmergencyContact;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_SOS_MESSAGE: &str =
    "EMERGENCY SOS: I need immediate assistance. This is an automated emergency alert.";
pub const SIMULATED_DELAY: Duration = Duration::from_millis(1000);

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmsError {
    #[error("Please enter a phone number or select a contact")]
    MissingPhone,
    #[error("Please enter a message")]
    EmptyMessage,
    #[error("No emergency contacts found. Please add contacts in Settings.")]
    NoContacts,
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway rejected message with status {0}")]
    Rejected(u16),
}

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SmsError>> + Send + 'a>>;

/// Delivers a text message to one phone number.
pub trait SmsGateway: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, phone: &'a str, body: &'a str) -> SendFuture<'a>;
}

pub type SharedGateway = Arc<dyn SmsGateway>;

/// Pretends to deliver after a fixed delay. Always succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedGateway {
    delay: Duration,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(SIMULATED_DELAY)
    }
}

impl SimulatedGateway {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl SmsGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn send<'a>(&'a self, phone: &'a str, body: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            info!(phone, chars = body.chars().count(), "simulated SMS delivered");
            Ok(())
        })
    }
}

#[derive(Serialize)]
struct OutgoingSms<'a> {
    to: &'a str,
    body: &'a str,
}

/// Posts `{"to", "body"}` as JSON to a gateway URL; any 2xx is delivery.
#[derive(Debug, Clone)]
pub struct HttpSmsGateway {
    http: reqwest::Client,
    url: String,
}

impl HttpSmsGateway {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
        }
    }
}

impl SmsGateway for HttpSmsGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, phone: &'a str, body: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            let response = self
                .http
                .post(&self.url)
                .json(&OutgoingSms { to: phone, body })
                .send()
                .await
                .map_err(|err| SmsError::Transport(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(SmsError::Rejected(status.as_u16()));
            }
            debug!(phone, %status, "gateway accepted SMS");
            Ok(())
        })
    }
}

pub fn gateway_from_config(url: Option<&str>) -> SharedGateway {
    match url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => Arc::new(HttpSmsGateway::new(url)),
        None => Arc::new(SimulatedGateway::default()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub contact_name: String,
    pub phone: String,
    pub outcome: Result<(), SmsError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SosReport {
    pub deliveries: Vec<Delivery>,
}

impl SosReport {
    pub fn sent_count(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|delivery| delivery.outcome.is_ok())
            .count()
    }

    pub fn summary(&self) -> String {
        format!("Emergency SOS signal sent to {} contact(s)", self.sent_count())
    }
}

/// Sends messages through a gateway and records the outcome in the
/// activity log.
#[derive(Clone)]
pub struct Notifier {
    gateway: SharedGateway,
    log: SharedActivityLog,
}

impl Notifier {
    pub fn new(gateway: SharedGateway, log: SharedActivityLog) -> Self {
        Self { gateway, log }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    pub async fn send_sms(&self, phone: &str, message: &str) -> Result<(), SmsError> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(SmsError::MissingPhone);
        }
        if message.trim().is_empty() {
            return Err(SmsError::EmptyMessage);
        }

        match self.gateway.send(phone, message).await {
            Ok(()) => {
                self.log.success(format!("SMS sent to {phone}"));
                Ok(())
            }
            Err(err) => {
                self.log.error(format!("Failed to send SMS: {err}"));
                Err(err)
            }
        }
    }

    /// Sends the SOS text to every contact concurrently. Individual failures
    /// are reported per contact; only an empty contact list is an error.
    pub async fn send_sos(
        &self,
        contacts: &[EmergencyContact],
        message: Option<&str>,
    ) -> Result<SosReport, SmsError> {
        if contacts.is_empty() {
            self.log.error(SmsError::NoContacts.to_string());
            return Err(SmsError::NoContacts);
        }

        let body: Arc<str> = Arc::from(
            message
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .unwrap_or(DEFAULT_SOS_MESSAGE),
        );

        let mut join_set = tokio::task::JoinSet::new();
        for (idx, contact) in contacts.iter().enumerate() {
            let gateway = Arc::clone(&self.gateway);
            let body = Arc::clone(&body);
            let phone = contact.phone.clone();
            join_set.spawn(async move {
                let outcome = gateway.send(&phone, &body).await;
                (idx, outcome)
            });
        }

        let mut outcomes = vec![None; contacts.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(err) => debug!("SOS delivery task ended abnormally: {err}"),
            }
        }

        let deliveries = contacts
            .iter()
            .zip(outcomes)
            .map(|(contact, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| Err(SmsError::Transport("delivery task aborted".to_owned())));
                match &outcome {
                    Ok(()) => self
                        .log
                        .success(format!("Emergency message sent to {}", contact.phone)),
                    Err(err) => self
                        .log
                        .error(format!("Failed to send emergency message: {err}")),
                }
                Delivery {
                    contact_name: contact.name.clone(),
                    phone: contact.phone.clone(),
                    outcome,
                }
            })
            .collect::<Vec<_>>();

        let report = SosReport { deliveries };
        self.log.warning(report.summary());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_SOS_MESSAGE, HttpSmsGateway, Notifier, SendFuture, SimulatedGateway, SmsError,
        SmsGateway,
    };
    use crate::activity::{ActivityLog, LogLevel};
    use crate::contacts::EmergencyContact;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingGateway {
        failing_phone: Option<String>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl SmsGateway for RecordingGateway {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send<'a>(&'a self, phone: &'a str, body: &'a str) -> SendFuture<'a> {
            Box::pin(async move {
                if self.failing_phone.as_deref() == Some(phone) {
                    return Err(SmsError::Rejected(503));
                }
                self.sent.lock().push((phone.to_owned(), body.to_owned()));
                Ok(())
            })
        }
    }

    fn contact(name: &str, phone: &str) -> EmergencyContact {
        EmergencyContact {
            id: name.to_lowercase(),
            name: name.to_owned(),
            phone: phone.to_owned(),
            relationship: None,
        }
    }

    #[tokio::test]
    async fn sos_without_contacts_fails() {
        let log = ActivityLog::shared();
        let notifier = Notifier::new(Arc::new(SimulatedGateway::new(Duration::ZERO)), log.clone());
        let err = notifier.send_sos(&[], None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "No emergency contacts found. Please add contacts in Settings."
        );
        assert_eq!(log.entries()[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn sos_reports_each_contact_in_order() {
        let gateway = Arc::new(RecordingGateway {
            failing_phone: Some("+2".to_owned()),
            ..RecordingGateway::default()
        });
        let log = ActivityLog::shared();
        let notifier = Notifier::new(gateway.clone(), log.clone());
        let contacts = [contact("A", "+1"), contact("B", "+2"), contact("C", "+3")];

        let report = notifier.send_sos(&contacts, None).await.unwrap();
        assert_eq!(report.deliveries.len(), 3);
        assert_eq!(report.deliveries[1].contact_name, "B");
        assert_eq!(report.deliveries[1].outcome, Err(SmsError::Rejected(503)));
        assert_eq!(report.summary(), "Emergency SOS signal sent to 2 contact(s)");

        let sent = gateway.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, body)| body == DEFAULT_SOS_MESSAGE));
        assert!(log.entries().iter().any(|e| e.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn sms_requires_phone_and_message() {
        let notifier = Notifier::new(
            Arc::new(SimulatedGateway::new(Duration::ZERO)),
            ActivityLog::shared(),
        );
        assert_eq!(
            notifier.send_sms(" ", "hi").await,
            Err(SmsError::MissingPhone)
        );
        assert_eq!(
            notifier.send_sms("+1", "  ").await,
            Err(SmsError::EmptyMessage)
        );
        assert!(notifier.send_sms("+1", "hi").await.is_ok());
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0_u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some((head, body)) = text.split_once("\r\n\r\n") {
                let length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if body.len() >= length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    async fn gateway_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response =
                format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            request
        });
        (format!("http://{addr}/sms"), handle)
    }

    #[tokio::test]
    async fn http_gateway_posts_json() {
        let (url, server) = gateway_server("200 OK").await;
        let gateway = HttpSmsGateway::new(url);
        gateway.send("+15550100", "robot found survivor").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /sms"));
        assert!(request.contains(r#""to":"+15550100""#));
        assert!(request.contains(r#""body":"robot found survivor""#));
    }

    #[tokio::test]
    async fn http_gateway_maps_error_status() {
        let (url, _server) = gateway_server("500 Internal Server Error").await;
        let gateway = HttpSmsGateway::new(url);
        assert_eq!(
            gateway.send("+1", "x").await,
            Err(SmsError::Rejected(500))
        );
    }
}
