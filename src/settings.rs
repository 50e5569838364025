use std::time::Duration;

use crate::service::ServiceName;

/// Agent settings consumed by the transport.
///
/// Loading settings from disk or the command line is left to the caller;
/// this is the already-populated result.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Settings {
    /// Default server for every service.
    pub server: String,

    /// Port of [`Settings::server`].
    pub serverport: u16,

    /// Server for the certificate authority, if it differs from [`Settings::server`].
    pub ca_server: Option<String>,

    /// Port of [`Settings::ca_server`].
    pub ca_port: Option<u16>,

    /// Server for reports, if it differs from [`Settings::server`].
    pub report_server: Option<String>,

    /// Port of [`Settings::report_server`].
    pub report_port: Option<u16>,

    /// Servers tried in order. Entries without a port use [`Settings::serverport`].
    pub server_list: Vec<(String, Option<u16>)>,

    /// Discover servers from DNS SRV records.
    pub use_srv_records: bool,

    /// Domain searched for SRV records.
    pub srv_domain: Option<String>,

    /// Sent as `User-Agent`.
    pub http_user_agent: String,

    /// Sent as `X-Puppet-Version`.
    pub agent_version: String,

    /// Interval between agent runs. No `Retry-After` sleep lasts longer.
    pub runinterval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let agent_version = env!("CARGO_PKG_VERSION").to_owned();
        Self {
            server: "puppet".into(),
            serverport: 8140,
            ca_server: None,
            ca_port: None,
            report_server: None,
            report_port: None,
            server_list: Vec::new(),
            use_srv_records: false,
            srv_domain: None,
            http_user_agent: format!("servicedriver/{agent_version}"),
            agent_version,
            runinterval: Duration::from_secs(30 * 60),
        }
    }
}

impl Settings {
    /// Set the default server and port.
    pub fn with_server(mut self, server: impl Into<String>, port: u16) -> Self {
        self.server = server.into();
        self.serverport = port;
        self
    }

    /// Use a dedicated certificate authority server.
    pub fn with_ca_server(mut self, server: impl Into<String>, port: Option<u16>) -> Self {
        self.ca_server = Some(server.into());
        self.ca_port = port;
        self
    }

    /// Use a dedicated report server.
    pub fn with_report_server(mut self, server: impl Into<String>, port: Option<u16>) -> Self {
        self.report_server = Some(server.into());
        self.report_port = port;
        self
    }

    /// Try each of `servers` in order.
    pub fn with_server_list<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<u16>)>,
        S: Into<String>,
    {
        self.server_list = servers
            .into_iter()
            .map(|(host, port)| (host.into(), port))
            .collect();
        self
    }

    /// Discover servers from SRV records in `domain`.
    pub fn with_srv_domain(mut self, domain: impl Into<String>) -> Self {
        self.use_srv_records = true;
        self.srv_domain = Some(domain.into());
        self
    }

    /// The configured host and port for `name`.
    ///
    /// `ca` and `report` use their dedicated server when one is set, falling
    /// back to [`Settings::server`] and [`Settings::serverport`].
    pub fn endpoint(&self, name: ServiceName) -> (&str, u16) {
        let dedicated = match name {
            ServiceName::Ca => self.ca_server.as_deref().map(|host| (host, self.ca_port)),
            ServiceName::Report => self
                .report_server
                .as_deref()
                .map(|host| (host, self.report_port)),
            _ => None,
        };

        match dedicated {
            Some((host, port)) => (host, port.unwrap_or(self.serverport)),
            None => (&self.server, self.serverport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.endpoint(ServiceName::Puppet), ("puppet", 8140));
        assert_eq!(settings.endpoint(ServiceName::Ca), ("puppet", 8140));
        assert_eq!(settings.runinterval, Duration::from_secs(1800));
        assert!(!settings.use_srv_records);
    }

    #[test]
    fn dedicated_servers() {
        let settings = Settings::default()
            .with_server("main", 8140)
            .with_ca_server("ca.example.com", Some(8141))
            .with_report_server("reports.example.com", None);

        assert_eq!(settings.endpoint(ServiceName::Ca), ("ca.example.com", 8141));
        assert_eq!(
            settings.endpoint(ServiceName::Report),
            ("reports.example.com", 8140)
        );
        assert_eq!(settings.endpoint(ServiceName::Fileserver), ("main", 8140));
    }
}
