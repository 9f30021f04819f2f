use crate::Error;
use crate::ssh_stream::SshStream;
use regex::Regex;
use std::time::Duration;

/// What probing one port for an ssh service produced
pub enum ScanOutcome {
    /// Banner received and matched by the configured pattern
    Verified(String),
    /// Banner received but not matched
    NotVerified(String),
    /// Connection refused, reset or otherwise unreachable
    NoPortAddr,
    /// Connect or banner read ran out of time
    TimeExceed,
}

/// Connects to one port, grabs the first `SSH-` identification line and
/// classifies the port. Without a pattern every reachable ssh banner
/// verifies.
pub fn check_port(
    host: &str,
    port: u16,
    client_id: &str,
    pattern: Option<&Regex>,
    timeout: Duration,
) -> ScanOutcome {
    match grab_banner(host, port, client_id, timeout) {
        Ok(banner) => {
            if pattern.is_none_or(|re| re.is_match(&banner)) {
                ScanOutcome::Verified(banner)
            } else {
                ScanOutcome::NotVerified(banner)
            }
        }
        Err(Error::Timeout) => ScanOutcome::TimeExceed,
        Err(err) => {
            tracing::debug!(port, "scan failed: {err}");
            ScanOutcome::NoPortAddr
        }
    }
}

/// Sends our identification and reads the server's, one connection per call
fn grab_banner(host: &str, port: u16, client_id: &str, timeout: Duration) -> Result<String, Error> {
    let mut stream = SshStream::connect(host, port, timeout)?;
    stream.send_id_string(client_id)?;
    stream.read_server_id()
}
