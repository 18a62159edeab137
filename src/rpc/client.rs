//! Client side of the RPC gateway, used by the CLI

use super::{
    AllowLanParams, AuthParams, ConnectParams, MssfixParams, Request, RpcError, ServerMessage,
    TunnelOptions,
};
use crate::config::GeoLocation;
use crate::net::{RelayEndpoint, SecuritySettings};
use crate::tunnel::{Notification, TunnelState};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct RpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    /// Notifications that arrived while waiting for a response
    pending: VecDeque<Notification>,
}

impl RpcClient {
    /// Connect and authenticate
    pub async fn connect(addr: SocketAddr, token: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
            pending: VecDeque::new(),
        };
        client
            .call_raw(
                "auth",
                serde_json::to_value(AuthParams {
                    token: token.to_string(),
                })?,
            )
            .await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<ServerMessage, RpcError> {
        loop {
            let line = self.lines.next_line().await?.ok_or(RpcError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    async fn call_raw(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        loop {
            match self.read_message().await? {
                ServerMessage::Notification { notification } => self.pending.push_back(notification),
                ServerMessage::Response(response) if response.id == id || response.id == 0 => {
                    if let Some(error) = response.error {
                        return Err(RpcError::Remote {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return Ok(response.result.unwrap_or(Value::Null));
                }
                ServerMessage::Response(_) => continue,
            }
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> Result<T, RpcError> {
        let value = self.call_raw(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn connect_tunnel(
        &mut self,
        relay: RelayEndpoint,
        settings: Option<SecuritySettings>,
    ) -> Result<(), RpcError> {
        let params = serde_json::to_value(ConnectParams { relay, settings })?;
        self.call_raw("connect", params).await.map(|_| ())
    }

    pub async fn disconnect(&mut self) -> Result<(), RpcError> {
        self.call_raw("disconnect", Value::Null).await.map(|_| ())
    }

    pub async fn block(&mut self) -> Result<(), RpcError> {
        self.call_raw("block", Value::Null).await.map(|_| ())
    }

    pub async fn reset(&mut self) -> Result<(), RpcError> {
        self.call_raw("reset", Value::Null).await.map(|_| ())
    }

    pub async fn get_state(&mut self) -> Result<TunnelState, RpcError> {
        self.call("get_state", Value::Null).await
    }

    pub async fn get_current_location(&mut self) -> Result<Option<GeoLocation>, RpcError> {
        self.call("get_current_location", Value::Null).await
    }

    pub async fn set_allow_lan(&mut self, allow_lan: bool) -> Result<(), RpcError> {
        let params = serde_json::to_value(AllowLanParams { allow_lan })?;
        self.call_raw("set_allow_lan", params).await.map(|_| ())
    }

    pub async fn get_allow_lan(&mut self) -> Result<bool, RpcError> {
        self.call("get_allow_lan", Value::Null).await
    }

    /// `None` clears the option
    pub async fn set_openvpn_mssfix(&mut self, mssfix: Option<u16>) -> Result<(), RpcError> {
        let params = serde_json::to_value(MssfixParams { mssfix })?;
        self.call_raw("set_openvpn_mssfix", params).await.map(|_| ())
    }

    pub async fn get_tunnel_options(&mut self) -> Result<TunnelOptions, RpcError> {
        self.call("get_tunnel_options", Value::Null).await
    }

    pub async fn subscribe(&mut self) -> Result<(), RpcError> {
        self.call_raw("subscribe", Value::Null).await.map(|_| ())
    }

    /// Next notification after [`subscribe`](Self::subscribe)
    pub async fn next_notification(&mut self) -> Result<Notification, RpcError> {
        if let Some(notification) = self.pending.pop_front() {
            return Ok(notification);
        }
        loop {
            if let ServerMessage::Notification { notification } = self.read_message().await? {
                return Ok(notification);
            }
        }
    }
}
