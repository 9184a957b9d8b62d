use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use ssh2::Channel;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Server keepalive interval; without it the edge drops idle CLI sessions.
const KEEPALIVE_SECS: u32 = 30;
/// The CLI prints a banner when the shell opens; give it a moment.
const BANNER_SETTLE: Duration = Duration::from_secs(1);

static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d{1,3}\.){3}\d{1,3}$").unwrap());
static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}$").unwrap());

#[derive(Debug, Error)]
pub enum NsxError {
    #[error("NSX edge {host} unavailable: {details}")]
    Unavailable { host: String, details: String },

    #[error("logical switch '{0}' not found")]
    SwitchNotFound(String),
}

struct ShellSession {
    session: ssh2::Session,
    channel: Channel,
}

/// MAC → IP resolver backed by the ARP table of a logical switch on an NSX
/// edge, queried over an interactive SSH CLI.
///
/// The shell is opened lazily and reused across calls while its transport
/// stays alive. Any channel error closes the shell and the command is
/// retried once on a fresh one; a second failure surfaces as `Unavailable`.
pub struct NsxArpResolver {
    host: String,
    port: u16,
    user: String,
    password: String,
    switch_name: String,
    cli_timeout: Duration,
    shell: Option<ShellSession>,
}

impl NsxArpResolver {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        switch_name: &str,
        cli_timeout: Duration,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            switch_name: switch_name.to_string(),
            cli_timeout,
            shell: None,
        }
    }

    /// Resolve an IP for the given MAC from a fresh ARP table dump.
    /// `Ok(None)` means the edge has no entry yet; callers poll.
    pub fn get_ip_by_mac(&mut self, mac: &str) -> Result<Option<String>, NsxError> {
        let listing = self.send_command("get logical-switch")?;
        let switch_id = find_switch_id(&listing, &self.switch_name)
            .ok_or_else(|| NsxError::SwitchNotFound(self.switch_name.clone()))?;
        debug!(switch = %self.switch_name, id = %switch_id, "resolved logical switch");

        let raw = self.send_command(&format!("get logical-switch {} arp-table", switch_id))?;
        let arp = parse_arp_table(&raw);
        Ok(arp.get(&mac.to_ascii_lowercase()).cloned())
    }

    /// Drop the cached shell; the next command reconnects.
    pub fn close(&mut self) {
        self.shell = None;
    }

    fn send_command(&mut self, cmd: &str) -> Result<String, NsxError> {
        match self.try_send(cmd) {
            Ok(out) => Ok(out),
            Err(first) => {
                warn!(host = %self.host, error = %first, "NSX channel error, reopening shell");
                self.shell = None;
                self.try_send(cmd).map_err(|e| NsxError::Unavailable {
                    host: self.host.clone(),
                    details: format!("{} (after reconnect; first error: {})", e, first),
                })
            }
        }
    }

    fn try_send(&mut self, cmd: &str) -> Result<String, NsxError> {
        self.ensure_shell()?;
        let shell = self.shell.as_mut().unwrap();
        let sent = shell
            .channel
            .write_all(format!("{}\n", cmd).as_bytes())
            .and_then(|_| shell.channel.flush());
        if let Err(e) = sent {
            self.shell = None;
            return Err(NsxError::Unavailable {
                host: self.host.clone(),
                details: format!("send failed: {}", e),
            });
        }
        let shell = self.shell.as_mut().unwrap();
        Ok(read_until_quiescent(
            &shell.session,
            &mut shell.channel,
            self.cli_timeout,
        ))
    }

    fn ensure_shell(&mut self) -> Result<(), NsxError> {
        if let Some(shell) = &mut self.shell
            && !shell.channel.eof()
            && shell.session.keepalive_send().is_ok()
        {
            return Ok(());
        }
        self.shell = Some(self.open_shell()?);
        Ok(())
    }

    fn open_shell(&self) -> Result<ShellSession, NsxError> {
        let unavailable = |details: String| NsxError::Unavailable {
            host: self.host.clone(),
            details,
        };

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| unavailable(format!("address resolution failed: {}", e)))?
            .next()
            .ok_or_else(|| unavailable("address resolution returned nothing".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| unavailable(format!("tcp connect failed: {}", e)))?;

        let mut session =
            ssh2::Session::new().map_err(|e| unavailable(format!("ssh init failed: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| unavailable(format!("ssh handshake failed: {}", e)))?;
        session
            .userauth_password(&self.user, &self.password)
            .map_err(|e| unavailable(format!("ssh auth failed: {}", e)))?;
        session.set_keepalive(true, KEEPALIVE_SECS);

        let mut channel = session
            .channel_session()
            .map_err(|e| unavailable(format!("channel open failed: {}", e)))?;
        channel
            .request_pty("vt100", None, None)
            .and_then(|_| channel.shell())
            .map_err(|e| unavailable(format!("shell open failed: {}", e)))?;

        // Drain the login banner so it never prefixes a command's output.
        std::thread::sleep(BANNER_SETTLE);
        let banner = read_until_quiescent(&session, &mut channel, self.cli_timeout);
        debug!(bytes = banner.len(), "drained NSX CLI banner");

        info!(host = %self.host, port = self.port, "opened NSX CLI shell");
        Ok(ShellSession { session, channel })
    }
}

/// Read channel output until it stays silent for `quiet`.
fn read_until_quiescent(session: &ssh2::Session, channel: &mut Channel, quiet: Duration) -> String {
    session.set_timeout(quiet.as_millis() as u32);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            // Timeout or channel error: the CLI has gone quiet.
            Err(_) => break,
        }
    }
    session.set_timeout(0);
    String::from_utf8_lossy(&out).into_owned()
}

/// Pick the UUID out of the `get logical-switch` listing for a named switch.
fn find_switch_id(listing: &str, switch_name: &str) -> Option<String> {
    if switch_name.is_empty() {
        return None;
    }
    for line in listing.lines() {
        if line.contains(switch_name) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                return Some(parts[1].to_string());
            }
        }
    }
    None
}

/// Parse an ARP table dump into a lowercased-MAC → IP map.
///
/// Rows look like `<vni> <IPv4> <MAC> <flags...>`; anything else (headers,
/// prompts, separators) is skipped.
pub fn parse_arp_table(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in raw.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && IPV4_RE.is_match(parts[1]) && MAC_RE.is_match(parts[2]) {
            map.insert(parts[2].to_ascii_lowercase(), parts[1].to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP_DUMP: &str = "\
zeon-edge> get logical-switch 528d4a02-1f22-4f0d-b6a7-0003c9a56a7b arp-table
                 Logical Switch ARP Table
-----------------------------------------------------------------------
    VNI      IP              MAC               Connection-ID    Flags
   69633     192.0.2.77      00:50:56:aa:68:16      1            0
   69633     192.0.2.78      00:50:56:AA:68:17      1            0
   69633     not-an-ip       00:50:56:aa:68:18      1            0
zeon-edge>";

    #[test]
    fn test_parse_arp_table() {
        let map = parse_arp_table(ARP_DUMP);
        assert_eq!(map.len(), 2);
        assert_eq!(map["00:50:56:aa:68:16"], "192.0.2.77");
        // MAC keys are lowercased regardless of CLI case.
        assert_eq!(map["00:50:56:aa:68:17"], "192.0.2.78");
    }

    #[test]
    fn test_parse_arp_table_ignores_noise() {
        assert!(parse_arp_table("").is_empty());
        assert!(parse_arp_table("-----\nVNI IP MAC\nprompt>").is_empty());
    }

    #[test]
    fn test_parse_arp_table_idempotent_over_reformat() {
        let map = parse_arp_table(ARP_DUMP);
        let reformatted: String = map
            .iter()
            .map(|(mac, ip)| format!("   69633     {}      {}      1            0\n", ip, mac))
            .collect();
        assert_eq!(parse_arp_table(&reformatted), map);
    }

    #[test]
    fn test_find_switch_id() {
        // The CLI prefixes each row with an index; the UUID is the second
        // whitespace-separated column.
        let listing = "\
zeon-edge> get logical-switch
   Idx  UUID                                   VNI     Name               Type
   1    528d4a02-1f22-4f0d-b6a7-0003c9a56a7b   69633   zeon-login-net     OVERLAY
   2    9b1c0de4-55aa-4a21-bc31-7e0f2d9a11ef   69634   zeon-mgmt-net      OVERLAY";
        assert_eq!(
            find_switch_id(listing, "zeon-login-net").as_deref(),
            Some("528d4a02-1f22-4f0d-b6a7-0003c9a56a7b")
        );
        assert!(find_switch_id(listing, "no-such-switch").is_none());
        assert!(find_switch_id(listing, "").is_none());
    }
}
