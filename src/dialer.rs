use crate::error::TorError;
use log::debug;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

/// Opens outbound connections through Tor's SOCKS5 port, for `.onion` and clearnet targets alike
#[derive(Clone, Debug)]
pub struct TorDialer {
    proxy_addr: String,
    credentials: Option<(String, String)>,
}

impl TorDialer {
    /// `credentials` are a SOCKS username and password; Tor uses them for stream isolation
    pub fn new(proxy_addr: &str, credentials: Option<(String, String)>) -> Self {
        Self {
            proxy_addr: proxy_addr.to_string(),
            credentials,
        }
    }

    /// Connect to `address` (`host:port`) over `network`, which must be a TCP network
    pub async fn dial(&self, network: &str, address: &str) -> Result<TcpStream, TorError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(TorError::protocol_error(&format!(
                "Cannot dial over '{}' through SOCKS5",
                network
            )));
        }
        debug!("Dialing {} via SOCKS5 proxy {}", address, self.proxy_addr);
        let stream = match &self.credentials {
            None => Socks5Stream::connect(self.proxy_addr.as_str(), address).await?,
            Some((username, password)) => {
                Socks5Stream::connect_with_password(
                    self.proxy_addr.as_str(),
                    address,
                    username,
                    password,
                )
                .await?
            }
        };
        Ok(stream.into_inner())
    }
}
