use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::{MailError, Mailer};

/// [`Mailer`] over an SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpMailer {
    /// Builds a relay client. With `use_tls`, port 465 gets implicit TLS and
    /// any other port requires STARTTLS.
    pub fn new(
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        use_tls: bool,
    ) -> Result<Self, MailError> {
        let mut builder = if use_tls {
            let tls = TlsParameters::new(host.to_string())
                .map_err(|e| MailError::InvalidConfig(format!("TLS configuration: {e}")))?;
            if port == 465 {
                AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                    .map_err(|e| MailError::InvalidConfig(format!("SMTP relay: {e}")))?
                    .port(port)
                    .tls(Tls::Wrapper(tls))
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                    .map_err(|e| MailError::InvalidConfig(format!("SMTP relay: {e}")))?
                    .port(port)
                    .tls(Tls::Required(tls))
            }
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port)
        };

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
        })
    }
}

fn parse_address(raw: &str) -> Result<Address, MailError> {
    raw.parse().map_err(|e: lettre::address::AddressError| MailError::InvalidAddress {
        address: raw.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, from: &str, to: &[String], message: &[u8]) -> Result<(), MailError> {
        let recipients = to
            .iter()
            .map(|addr| parse_address(addr))
            .collect::<Result<Vec<_>, _>>()?;
        let envelope = Envelope::new(Some(parse_address(from)?), recipients)
            .map_err(|e| MailError::InvalidConfig(e.to_string()))?;

        self.transport
            .send_raw(&envelope, message)
            .await
            .map_err(|e| MailError::SendFailed(e.to_string()))?;
        tracing::info!(to = ?to, "sent mail");
        Ok(())
    }

    fn hostname(&self) -> &str {
        &self.host
    }
}
