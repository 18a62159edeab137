//! Named subcommand routing
//!
//! A [`CommandDispatcher`] maps subcommand names to handlers. Handlers either
//! take no arguments or an ordered list of `key=value` pairs.

use crate::net::{RelayEndpoint, TransportProtocol, parse_yes_no, validate_interface_alias};
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown subcommand: {0}")]
    UnknownSubcommand(String),
    #[error("Missing argument: {0}")]
    MissingArgument(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidArgument { key: String, value: String },
    #[error("Expected key=value, got: {0}")]
    MalformedArgument(String),
    #[error("Subcommand {0} takes no arguments")]
    UnexpectedArguments(String),
    #[error("Subcommand already registered: {0}")]
    DuplicateSubcommand(String),
    #[error("{0}")]
    Failed(String),
}

/// Ordered `key=value` arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    pairs: Vec<(String, String)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` tokens as given on a command line
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self, DispatchError> {
        let mut args = Self::new();
        for token in tokens {
            let token = token.as_ref();
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| DispatchError::MalformedArgument(token.to_string()))?;
            if key.is_empty() {
                return Err(DispatchError::MalformedArgument(token.to_string()));
            }
            args.push(key, value);
        }
        Ok(args)
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// First value given for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str, DispatchError> {
        self.get(key)
            .ok_or_else(|| DispatchError::MissingArgument(key.to_string()))
    }

    /// `yes`/`no`, case-insensitive
    pub fn require_yes_no(&self, key: &str) -> Result<bool, DispatchError> {
        let value = self.require(key)?;
        parse_yes_no(value).ok_or_else(|| invalid(key, value))
    }

    pub fn require_ip(&self, key: &str) -> Result<IpAddr, DispatchError> {
        let value = self.require(key)?;
        value.parse().map_err(|_| invalid(key, value))
    }

    /// `relay`, `port` and `protocol` as one endpoint
    pub fn require_relay(&self) -> Result<RelayEndpoint, DispatchError> {
        let ip = self.require_ip("relay")?;
        let port_str = self.require("port")?;
        let port: u16 = port_str
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid("port", port_str))?;
        let protocol_str = self.require("protocol")?;
        let protocol: TransportProtocol = protocol_str
            .parse()
            .map_err(|_| invalid("protocol", protocol_str))?;
        Ok(RelayEndpoint::new(ip, port, protocol))
    }

    /// An interface name safe to embed in firewall scripts
    pub fn require_alias(&self, key: &str) -> Result<&str, DispatchError> {
        let value = self.require(key)?;
        validate_interface_alias(value).map_err(|_| invalid(key, value))
    }

    /// Addresses separated by commas or whitespace
    pub fn require_ip_list(&self, key: &str) -> Result<Vec<IpAddr>, DispatchError> {
        let value = self.require(key)?;
        value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(|_| invalid(key, s)))
            .collect()
    }
}

fn invalid(key: &str, value: &str) -> DispatchError {
    DispatchError::InvalidArgument {
        key: key.to_string(),
        value: value.to_string(),
    }
}

type NoArgsFn<C> = Box<dyn Fn(&mut C) -> Result<(), DispatchError> + Send + Sync>;
type WithArgsFn<C> = Box<dyn Fn(&mut C, &Arguments) -> Result<(), DispatchError> + Send + Sync>;

pub enum Handler<C> {
    NoArgs(NoArgsFn<C>),
    WithArgs(WithArgsFn<C>),
}

impl<C> Handler<C> {
    pub fn no_args<F>(f: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        Handler::NoArgs(Box::new(f))
    }

    pub fn with_args<F>(f: F) -> Self
    where
        F: Fn(&mut C, &Arguments) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        Handler::WithArgs(Box::new(f))
    }
}

/// Routes subcommands to handlers operating on a context `C`
pub struct CommandDispatcher<C> {
    handlers: BTreeMap<String, Handler<C>>,
}

impl<C> Default for CommandDispatcher<C> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<C> CommandDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: Handler<C>) -> Result<(), DispatchError> {
        if self.handlers.contains_key(name) {
            return Err(DispatchError::DuplicateSubcommand(name.to_string()));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Registered names, sorted
    pub fn subcommands(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn dispatch(&self, context: &mut C, name: &str, args: &Arguments) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| DispatchError::UnknownSubcommand(name.to_string()))?;

        match handler {
            Handler::NoArgs(f) => {
                if !args.is_empty() {
                    return Err(DispatchError::UnexpectedArguments(name.to_string()));
                }
                f(context)
            }
            Handler::WithArgs(f) => f(context, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_dispatcher() -> CommandDispatcher<Vec<String>> {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register(
                "ping",
                Handler::no_args(|log: &mut Vec<String>| {
                    log.push("ping".to_string());
                    Ok(())
                }),
            )
            .unwrap();
        dispatcher
            .register(
                "echo",
                Handler::with_args(|log: &mut Vec<String>, args: &Arguments| {
                    log.push(args.require("text")?.to_string());
                    Ok(())
                }),
            )
            .unwrap();
        dispatcher
    }

    #[test]
    fn test_dispatch_routes_by_name() {
        let dispatcher = counter_dispatcher();
        let mut log = Vec::new();

        dispatcher.dispatch(&mut log, "ping", &Arguments::new()).unwrap();
        let args = Arguments::parse(&["text=hello"]).unwrap();
        dispatcher.dispatch(&mut log, "echo", &args).unwrap();

        assert_eq!(log, vec!["ping", "hello"]);
    }

    #[test]
    fn test_unknown_subcommand() {
        let dispatcher = counter_dispatcher();
        let result = dispatcher.dispatch(&mut Vec::new(), "Ping", &Arguments::new());
        assert_eq!(result, Err(DispatchError::UnknownSubcommand("Ping".into())));
    }

    #[test]
    fn test_missing_argument() {
        let dispatcher = counter_dispatcher();
        let result = dispatcher.dispatch(&mut Vec::new(), "echo", &Arguments::new());
        assert_eq!(result, Err(DispatchError::MissingArgument("text".into())));
    }

    #[test]
    fn test_no_args_handler_rejects_arguments() {
        let dispatcher = counter_dispatcher();
        let args = Arguments::parse(&["x=1"]).unwrap();
        let result = dispatcher.dispatch(&mut Vec::new(), "ping", &args);
        assert!(matches!(result, Err(DispatchError::UnexpectedArguments(_))));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dispatcher = counter_dispatcher();
        let result = dispatcher.register("ping", Handler::no_args(|_: &mut Vec<String>| Ok(())));
        assert_eq!(result, Err(DispatchError::DuplicateSubcommand("ping".into())));
        assert_eq!(dispatcher.subcommands().collect::<Vec<_>>(), vec!["echo", "ping"]);
    }

    #[test]
    fn test_parse_arguments() {
        let args = Arguments::parse(&["dhcp=yes", "dns=10.0.0.1,10.0.0.2", "dhcp=no"]).unwrap();
        assert_eq!(args.get("dhcp"), Some("yes"));
        assert!(Arguments::parse(&["novalue"]).is_err());
        assert!(Arguments::parse(&["=x"]).is_err());
    }

    #[test]
    fn test_yes_no_is_case_insensitive() {
        let args = Arguments::parse(&["a=YES", "b=No", "c=maybe"]).unwrap();
        assert!(args.require_yes_no("a").unwrap());
        assert!(!args.require_yes_no("b").unwrap());
        assert!(matches!(
            args.require_yes_no("c"),
            Err(DispatchError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_require_relay() {
        let args = Arguments::parse(&["relay=10.0.0.1", "port=1194", "protocol=TCP"]).unwrap();
        let relay = args.require_relay().unwrap();
        assert_eq!(relay.to_string(), "10.0.0.1:1194/tcp");

        let args = Arguments::parse(&["relay=10.0.0.1", "port=0", "protocol=udp"]).unwrap();
        assert!(matches!(
            args.require_relay(),
            Err(DispatchError::InvalidArgument { key, .. }) if key == "port"
        ));

        let args = Arguments::parse(&["port=1194"]).unwrap();
        assert_eq!(
            args.require_relay(),
            Err(DispatchError::MissingArgument("relay".into()))
        );
    }

    #[test]
    fn test_ip_list_separators() {
        let args = Arguments::parse(&["dns=10.0.0.1, 10.0.0.2 fd00::1"]).unwrap();
        assert_eq!(args.require_ip_list("dns").unwrap().len(), 3);
    }

    #[test]
    fn test_require_alias_rejects_script_metacharacters() {
        let args = Arguments::parse(&["tunnel=tun0", "bad=tun0\";drop"]).unwrap();
        assert_eq!(args.require_alias("tunnel"), Ok("tun0"));
        assert!(matches!(
            args.require_alias("bad"),
            Err(DispatchError::InvalidArgument { key, .. }) if key == "bad"
        ));
    }
}
