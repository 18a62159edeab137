//! Per-connection request handling

use super::broadcast::{SubscriberRegistry, Subscription};
use super::{
    AllowLanParams, AuthParams, ConnectParams, MssfixParams, OpenVpnTunnelOptions, RemoteError,
    Request, Response, ServerMessage, TunnelOptions,
};
use crate::config::ConfigError;
use crate::settings::SettingsStore;
use crate::tunnel::{CommandError, Notification, TunnelHandle};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct RpcGateway {
    handle: TunnelHandle,
    registry: Arc<SubscriberRegistry>,
    token: String,
    settings: Arc<SettingsStore>,
}

impl RpcGateway {
    pub fn new(
        handle: TunnelHandle,
        registry: Arc<SubscriberRegistry>,
        token: String,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            handle,
            registry,
            token,
            settings,
        }
    }

    /// Accept clients until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("RPC listening on {}", addr),
            Err(e) => warn!("RPC listener address unavailable: {}", e),
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("RPC accept failed: {}", e);
                    continue;
                }
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                debug!("RPC client connected from {}", peer);
                gateway.serve_connection(stream).await;
                debug!("RPC client {} disconnected", peer);
            });
        }
    }

    async fn serve_connection(&self, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut authenticated = false;
        let mut subscription: Option<Subscription> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("RPC read failed: {}", e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let (response, close) = self
                        .handle_line(&line, &mut authenticated, &mut subscription)
                        .await;
                    if let Err(e) = send(&mut writer, &ServerMessage::Response(response)).await {
                        warn!("RPC write failed: {}", e);
                        break;
                    }
                    if close {
                        break;
                    }
                }
                notification = next_notification(&mut subscription) => {
                    let Some(notification) = notification else {
                        warn!("Dropping RPC subscriber that fell behind");
                        break;
                    };
                    if let Err(e) = send(&mut writer, &ServerMessage::Notification { notification }).await {
                        warn!("RPC write failed: {}", e);
                        break;
                    }
                }
            }
        }

        if let Some(subscription) = subscription {
            self.registry.unsubscribe(subscription.id);
        }
    }

    /// Returns the response and whether to close the connection afterwards
    async fn handle_line(
        &self,
        line: &str,
        authenticated: &mut bool,
        subscription: &mut Option<Subscription>,
    ) -> (Response, bool) {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let error = RemoteError::new("invalid_request", e.to_string());
                return (Response::err(0, error), !*authenticated);
            }
        };
        let id = request.id;

        if !*authenticated {
            let ok = request.method == "auth"
                && params::<AuthParams>(request.params)
                    .map(|p| p.token == self.token)
                    .unwrap_or(false);
            if !ok {
                warn!("Rejecting unauthenticated RPC client");
                return (
                    Response::err(id, RemoteError::new("unauthorized", "authentication required")),
                    true,
                );
            }
            *authenticated = true;
            return (Response::ok(id, Value::Bool(true)), false);
        }

        debug!("RPC request {}: {}", id, request.method);
        let result = self.call(&request.method, request.params, subscription).await;
        let response = match result {
            Ok(value) => Response::ok(id, value),
            Err(error) => Response::err(id, error),
        };
        (response, false)
    }

    async fn call(
        &self,
        method: &str,
        params_value: Value,
        subscription: &mut Option<Subscription>,
    ) -> Result<Value, RemoteError> {
        match method {
            "auth" => Ok(Value::Bool(true)),
            "connect" => {
                let p: ConnectParams = params(params_value)?;
                let settings = p.settings.unwrap_or_else(|| self.settings.security());
                self.handle
                    .connect(p.relay, settings)
                    .await
                    .map_err(command_error)?;
                Ok(Value::Bool(true))
            }
            "disconnect" => {
                self.handle.disconnect().await.map_err(command_error)?;
                Ok(Value::Bool(true))
            }
            "block" => {
                self.handle.block().await.map_err(command_error)?;
                Ok(Value::Bool(true))
            }
            "reset" => {
                self.handle.reset().await.map_err(command_error)?;
                Ok(Value::Bool(true))
            }
            "get_state" => to_value(&self.handle.state()),
            "get_current_location" => match self.handle.state().relay() {
                Some(relay) => to_value(&self.settings.locate(relay)),
                None => Ok(Value::Null),
            },
            "set_allow_lan" => {
                let p: AllowLanParams = params(params_value)?;
                self.settings
                    .set_allow_lan(p.allow_lan)
                    .map_err(settings_error)?;
                Ok(Value::Bool(true))
            }
            "get_allow_lan" => Ok(Value::Bool(self.settings.allow_lan())),
            "set_openvpn_mssfix" => {
                let p: MssfixParams = params(params_value)?;
                self.settings.set_mssfix(p.mssfix).map_err(settings_error)?;
                Ok(Value::Bool(true))
            }
            "get_tunnel_options" => to_value(&TunnelOptions {
                openvpn: OpenVpnTunnelOptions {
                    mssfix: self.settings.mssfix(),
                },
            }),
            "subscribe" => {
                if subscription.is_none() {
                    *subscription = Some(self.registry.subscribe());
                }
                Ok(Value::Bool(true))
            }
            other => Err(RemoteError::new(
                "unknown_method",
                format!("unknown method: {}", other),
            )),
        }
    }
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|e| RemoteError::new("invalid_params", e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::new("internal", e.to_string()))
}

fn command_error(e: CommandError) -> RemoteError {
    let code = match e {
        CommandError::InvalidState { .. } => "invalid_state",
        CommandError::PolicyApply(_) => "policy_apply",
        CommandError::ProcessSpawn(_) => "process_spawn",
        CommandError::Unavailable => "unavailable",
    };
    RemoteError::new(code, e.to_string())
}

fn settings_error(e: ConfigError) -> RemoteError {
    let code = match e {
        ConfigError::Invalid(_) => "invalid_params",
        _ => "settings",
    };
    RemoteError::new(code, e.to_string())
}

async fn next_notification(subscription: &mut Option<Subscription>) -> Option<Notification> {
    match subscription {
        Some(subscription) => subscription.receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &ServerMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tunnel::{TunnelCommand, TunnelInbox, TunnelState, channel};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::tcp::OwnedWriteHalf;

    struct TestClient {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: std::net::SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_vec(&value).unwrap();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Value> {
            let line = self.lines.next_line().await.ok()??;
            Some(serde_json::from_str(&line).unwrap())
        }
    }

    async fn start() -> (std::net::SocketAddr, Arc<SubscriberRegistry>, TunnelInbox) {
        let (handle, inbox) = channel();
        let registry = Arc::new(SubscriberRegistry::new(8));
        let gateway = Arc::new(RpcGateway::new(
            handle,
            registry.clone(),
            "secret".to_string(),
            Arc::new(SettingsStore::new(Config::default(), None)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(gateway.serve(listener));
        (addr, registry, inbox)
    }

    async fn authed_client(addr: std::net::SocketAddr) -> TestClient {
        let mut client = TestClient::connect(addr).await;
        client
            .send(json!({"id": 1, "method": "auth", "params": {"token": "secret"}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["result"], true);
        client
    }

    #[tokio::test]
    async fn test_first_request_must_authenticate() {
        let (addr, _registry, _inbox) = start().await;
        let mut client = TestClient::connect(addr).await;

        client.send(json!({"id": 1, "method": "get_state"})).await;
        let response = client.recv().await.unwrap();
        assert_eq!(response["error"]["code"], "unauthorized");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let (addr, _registry, _inbox) = start().await;
        let mut client = TestClient::connect(addr).await;

        client
            .send(json!({"id": 1, "method": "auth", "params": {"token": "guess"}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_get_state_and_location() {
        let (addr, _registry, _inbox) = start().await;
        let mut client = authed_client(addr).await;

        client.send(json!({"id": 2, "method": "get_state"})).await;
        let response = client.recv().await.unwrap();
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"]["state"], "disconnected");

        client.send(json!({"id": 3, "method": "get_current_location"})).await;
        assert_eq!(client.recv().await.unwrap()["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_connect_is_forwarded_with_default_settings() {
        let (addr, _registry, mut inbox) = start().await;
        let mut client = authed_client(addr).await;

        client
            .send(json!({
                "id": 2,
                "method": "connect",
                "params": {"relay": {"ip": "1.2.3.4", "port": 1300, "protocol": "udp"}}
            }))
            .await;

        match inbox.commands.recv().await.unwrap() {
            TunnelCommand::Connect {
                relay,
                settings,
                reply,
            } => {
                assert_eq!(relay.to_string(), "1.2.3.4:1300/udp");
                assert_eq!(settings, Config::default().security);
                reply
                    .unwrap()
                    .send(Err(CommandError::InvalidState {
                        command: "connect",
                        state: "connected",
                    }))
                    .unwrap();
            }
            other => panic!("unexpected command {:?}", other),
        }

        let response = client.recv().await.unwrap();
        assert_eq!(response["error"]["code"], "invalid_state");
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params_keep_connection() {
        let (addr, _registry, _inbox) = start().await;
        let mut client = authed_client(addr).await;

        client.send(json!({"id": 2, "method": "teleport"})).await;
        assert_eq!(client.recv().await.unwrap()["error"]["code"], "unknown_method");

        client
            .send(json!({"id": 3, "method": "connect", "params": {"relay": "nope"}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["error"]["code"], "invalid_params");

        client.send(json!({"id": 4, "method": "get_state"})).await;
        assert!(client.recv().await.unwrap()["result"].is_object());
    }

    #[tokio::test]
    async fn test_subscribers_receive_notifications() {
        let (addr, registry, _inbox) = start().await;
        let mut a = authed_client(addr).await;
        let mut b = authed_client(addr).await;

        for client in [&mut a, &mut b] {
            client.send(json!({"id": 2, "method": "subscribe"})).await;
            assert_eq!(client.recv().await.unwrap()["result"], true);
        }
        assert_eq!(registry.len(), 2);

        for sequence in 1..=3 {
            registry.publish(&Notification::StateChanged {
                sequence,
                state: TunnelState::Disconnected,
            });
        }

        for client in [&mut a, &mut b] {
            for sequence in 1..=3 {
                let message = client.recv().await.unwrap();
                assert_eq!(message["notification"]["sequence"], sequence);
            }
        }

        drop(a);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while registry.len() != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_allow_lan_applies_to_next_connect() {
        let (addr, _registry, mut inbox) = start().await;
        let mut client = authed_client(addr).await;

        client.send(json!({"id": 2, "method": "get_allow_lan"})).await;
        assert_eq!(client.recv().await.unwrap()["result"], false);

        client
            .send(json!({"id": 3, "method": "set_allow_lan", "params": {"allow_lan": true}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["result"], true);

        client.send(json!({"id": 4, "method": "get_allow_lan"})).await;
        assert_eq!(client.recv().await.unwrap()["result"], true);

        client
            .send(json!({
                "id": 5,
                "method": "connect",
                "params": {"relay": {"ip": "1.2.3.4", "port": 1300, "protocol": "udp"}}
            }))
            .await;
        match inbox.commands.recv().await.unwrap() {
            TunnelCommand::Connect {
                settings, reply, ..
            } => {
                assert!(settings.permit_lan);
                reply.unwrap().send(Ok(())).unwrap();
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(client.recv().await.unwrap()["result"], true);
    }

    #[tokio::test]
    async fn test_mssfix_set_get_and_clear() {
        let (addr, _registry, _inbox) = start().await;
        let mut client = authed_client(addr).await;

        client
            .send(json!({"id": 2, "method": "set_openvpn_mssfix", "params": {"mssfix": 1360}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["result"], true);

        client.send(json!({"id": 3, "method": "get_tunnel_options"})).await;
        assert_eq!(
            client.recv().await.unwrap()["result"],
            json!({"openvpn": {"mssfix": 1360}})
        );

        client
            .send(json!({"id": 4, "method": "set_openvpn_mssfix", "params": {"mssfix": 0}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["error"]["code"], "invalid_params");

        client
            .send(json!({"id": 5, "method": "set_openvpn_mssfix", "params": {"mssfix": null}}))
            .await;
        assert_eq!(client.recv().await.unwrap()["result"], true);

        client.send(json!({"id": 6, "method": "get_tunnel_options"})).await;
        assert_eq!(
            client.recv().await.unwrap()["result"]["openvpn"]["mssfix"],
            Value::Null
        );
    }
}
