//! Channel establishment and program binding.

use std::sync::Arc;
use std::time::Duration;

use tonic::Code;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

use crate::error::ConnectError;
use crate::proto::{self, BfRuntimeClient};
use crate::schema::BfRtInfo;
use crate::session::{StreamSession, SubscribeOptions};
use crate::table::TableClient;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `host:port` of the management daemon, with or without scheme.
    pub addr: String,
    pub client_id: u32,
    pub device_id: u32,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub subscribe: SubscribeOptions,
}

impl ConnectOptions {
    pub fn new(addr: impl Into<String>, client_id: u32, device_id: u32) -> Self {
        Self {
            addr: addr.into(),
            client_id,
            device_id,
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
            subscribe: SubscribeOptions::default(),
        }
    }

    fn uri(&self) -> String {
        if self.addr.contains("://") {
            self.addr.clone()
        } else {
            format!("http://{}", self.addr)
        }
    }
}

/// Opens subscribed sessions with bounded retry.
pub struct ConnectionManager {
    options: ConnectOptions,
}

impl ConnectionManager {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Connect and subscribe. Every attempt builds a new channel and a new
    /// session; a failed attempt's channel is dropped, never reused.
    pub async fn connect(&self) -> Result<Connection, ConnectError> {
        let endpoint = Endpoint::from_shared(self.options.uri())
            .map_err(|e| ConnectError::InvalidAddress {
                addr: self.options.addr.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.options.subscribe.timeout);

        let attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(addr = %self.options.addr, attempt, "connecting to switch");
            match self.try_connect(&endpoint).await {
                Ok(connection) => {
                    info!(
                        addr = %self.options.addr,
                        client_id = self.options.client_id,
                        device_id = self.options.device_id,
                        attempt,
                        "connected to switch"
                    );
                    return Ok(connection);
                }
                Err(e) if attempt >= attempts => {
                    return Err(ConnectError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(addr = %self.options.addr, attempt, error = %e, "connection attempt failed");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }
    }

    async fn try_connect(&self, endpoint: &Endpoint) -> Result<Connection, ConnectError> {
        let channel = endpoint.connect().await?;
        let client = BfRuntimeClient::new(channel);
        let session = StreamSession::open(client.clone(), self.options.client_id);
        session
            .subscribe(self.options.device_id, &self.options.subscribe)
            .await?;
        Ok(Connection {
            client,
            session: Arc::new(session),
            client_id: self.options.client_id,
            device_id: self.options.device_id,
        })
    }
}

/// A subscribed session to one device.
pub struct Connection {
    client: BfRuntimeClient,
    session: Arc<StreamSession>,
    client_id: u32,
    device_id: u32,
}

impl Connection {
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    /// Bind this client to the program loaded on the device and return a
    /// table client for it. With no name, the first program the device
    /// reports is used. A bind answered with `Unknown` is tolerated.
    pub async fn bind_program(&self, program: Option<&str>) -> Result<TableClient, ConnectError> {
        let mut client = self.client.clone();
        let pipeline = client
            .get_forwarding_pipeline_config(proto::GetForwardingPipelineConfigRequest {
                device_id: self.device_id,
                client_id: self.client_id,
            })
            .await
            .map_err(ConnectError::PipelineConfig)?
            .into_inner();

        let program = match program.filter(|p| !p.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let discovered = pipeline
                    .config
                    .first()
                    .map(|c| c.p4_name.clone())
                    .ok_or(ConnectError::NoProgram {
                        device_id: self.device_id,
                    })?;
                info!(program = %discovered, "discovered loaded program");
                discovered
            }
        };

        let request = proto::SetForwardingPipelineConfigRequest {
            client_id: self.client_id,
            device_id: self.device_id,
            action: proto::set_forwarding_pipeline_config_request::Action::Bind as i32,
            base_path: String::new(),
            config: vec![proto::ForwardingPipelineConfig {
                p4_name: program.clone(),
                bfruntime_info: Vec::new(),
            }],
        };
        match client.set_forwarding_pipeline_config(request).await {
            Ok(_) => info!(program = %program, "bound to program"),
            Err(status) if status.code() == Code::Unknown => {
                debug!(program = %program, message = status.message(), "bind answered unknown, continuing");
            }
            Err(status) => return Err(ConnectError::Bind { program, status }),
        }

        let config = pipeline
            .config
            .iter()
            .find(|c| c.p4_name == program)
            .ok_or_else(|| ConnectError::ProgramNotLoaded {
                program: program.clone(),
                device_id: self.device_id,
            })?;
        let mut info = BfRtInfo::from_json(&config.bfruntime_info)?;
        if let Some(fixed) = pipeline.non_p4_config.as_ref().filter(|c| !c.bfruntime_info.is_empty()) {
            info = info.merge(BfRtInfo::from_json(&fixed.bfruntime_info)?);
        }
        debug!(program = %program, tables = info.tables().len(), "loaded table schema");

        Ok(TableClient::new(
            self.client.clone(),
            self.session.clone(),
            info,
            program,
            self.device_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_gets_scheme() {
        let opts = ConnectOptions::new("127.0.0.1:50052", 0, 0);
        assert_eq!(opts.uri(), "http://127.0.0.1:50052");
        let opts = ConnectOptions::new("http://switch:50052", 0, 0);
        assert_eq!(opts.uri(), "http://switch:50052");
    }

    #[tokio::test]
    async fn test_gives_up_with_last_cause() {
        let mut opts = ConnectOptions::new("127.0.0.1:1", 0, 0);
        opts.max_attempts = 2;
        opts.retry_delay = Duration::from_millis(10);
        opts.subscribe.timeout = Duration::from_millis(200);

        let err = ConnectionManager::new(opts).connect().await.err().unwrap();
        match err {
            ConnectError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ConnectError::Channel(_)));
            }
            other => panic!("expected exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_retried() {
        let opts = ConnectOptions::new("not a uri", 0, 0);
        let err = ConnectionManager::new(opts).connect().await.err().unwrap();
        assert!(matches!(err, ConnectError::InvalidAddress { .. }));
    }
}
