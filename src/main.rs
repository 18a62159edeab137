use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpnd::config::LOCAL_CONFIG;
use vpnd::firewall::{FirewallController, get_firewall_backend};
use vpnd::net::{RelayEndpoint, SecuritySettings, parse_yes_no};
use vpnd::rpc::{RpcClient, read_token_file};
use vpnd::tunnel::{BlockReason, Notification, TunnelState};
use vpnd::{Config, Error};

#[derive(Parser)]
#[command(name = "vpnd")]
#[command(about = "VPN tunnel daemon with a fail-closed kill switch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./vpnd.toml, then ~/.vpnd/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until terminated
    Daemon,
    /// Apply a firewall policy directly, bypassing the daemon
    ///
    /// Subcommands: connecting, connected, netblocked, reset.
    /// Example: vpnd policy connecting relay=1.2.3.4 port=1300 protocol=udp dhcp=yes lan=no
    Policy {
        subcommand: String,
        /// key=value arguments
        args: Vec<String>,
    },
    /// Ask the daemon to connect to a relay
    Connect {
        #[arg(long)]
        relay: std::net::IpAddr,
        #[arg(long)]
        port: String,
        #[arg(long, default_value = "udp")]
        protocol: String,
        /// Allow DHCP (yes/no); daemon default when omitted
        #[arg(long)]
        dhcp: Option<String>,
        /// Allow LAN traffic (yes/no); daemon default when omitted
        #[arg(long)]
        lan: Option<String>,
        /// Wait until the tunnel is up or blocked
        #[arg(long)]
        wait: bool,
    },
    /// Ask the daemon to disconnect
    Disconnect,
    /// Block all non-loopback traffic
    Block,
    /// Remove every daemon-owned firewall rule
    Reset,
    /// Show the tunnel state
    Status,
    /// Show where the current relay is
    Location,
    /// Print notifications as they happen
    Watch,
    /// Allow or block local network traffic on the next connect
    Lan {
        #[command(subcommand)]
        action: LanAction,
    },
    /// Manage tunnel specific options
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Generate default config file
    Init,
    /// OpenVPN script mode
    ///
    /// OpenVPN runs this for --up, --route-up and --down with the connection
    /// details in its environment. Do not call this directly.
    Plugin {
        /// Positional arguments OpenVPN appends (device, MTUs, addresses,
        /// init/restart); everything needed is read from the environment
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum LanAction {
    /// Change the allow LAN setting
    Set {
        #[arg(value_parser = ["allow", "block"])]
        policy: String,
    },
    /// Display the current allow LAN setting
    Get,
}

#[derive(Subcommand)]
enum TunnelAction {
    /// Manage options for OpenVPN tunnels
    Openvpn {
        #[command(subcommand)]
        action: OpenVpnAction,
    },
}

#[derive(Subcommand)]
enum OpenVpnAction {
    /// Set an OpenVPN option
    Set {
        #[command(subcommand)]
        option: OpenVpnOption,
    },
    /// Show the current OpenVPN options
    Get,
}

#[derive(Subcommand)]
enum OpenVpnOption {
    /// Set the mssfix parameter; an empty string clears it
    Mssfix { value: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Everything goes to stderr; OpenVPN captures the plugin's stdout
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_writer(std::io::stderr);
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Commands::Plugin { .. } = cli.command {
        if let Err(e) = vpnd::openvpn::run_plugin().await {
            error!("Plugin failed: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let (config, path) = Config::discover(cli.config.as_deref())?;
    match &path {
        Some(path) => info!("Using config {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    match cli.command {
        Commands::Daemon => {
            let plugin_binary = std::env::current_exe()?;
            // Settings changed over RPC go back to the file in use, or a new user config
            let config_path = path.clone().or_else(Config::user_config_path);
            vpnd::daemon::run(config, config_path, plugin_binary).await?;
        }
        Commands::Policy { subcommand, args } => {
            let backend = get_firewall_backend(config.firewall.backend).map_err(Error::from)?;
            let mut controller = FirewallController::new(backend);
            let mut stdout = std::io::stdout();
            vpnd::policy_cli::run_policy_command(&mut controller, &subcommand, &args, &mut stdout)
                .map_err(Error::from)?;
        }
        Commands::Connect {
            relay,
            port,
            protocol,
            dhcp,
            lan,
            wait,
        } => {
            let relay = RelayEndpoint::parse(&relay.to_string(), &port, &protocol)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            let settings = security_settings(&config, dhcp.as_deref(), lan.as_deref())?;

            let mut client = rpc_client(&config).await?;
            if wait {
                client.subscribe().await.map_err(Error::from)?;
            }
            client
                .connect_tunnel(relay, settings)
                .await
                .map_err(Error::from)?;
            println!("Connecting to {}", relay);

            if wait {
                wait_for_outcome(&mut client).await?;
            }
        }
        Commands::Disconnect => {
            rpc_client(&config).await?.disconnect().await.map_err(Error::from)?;
            println!("Disconnecting");
        }
        Commands::Block => {
            rpc_client(&config).await?.block().await.map_err(Error::from)?;
            println!("Blocking all traffic");
        }
        Commands::Reset => {
            rpc_client(&config).await?.reset().await.map_err(Error::from)?;
            println!("Firewall reset");
        }
        Commands::Status => {
            let state = rpc_client(&config).await?.get_state().await.map_err(Error::from)?;
            print_state(&state);
        }
        Commands::Location => {
            let location = rpc_client(&config)
                .await?
                .get_current_location()
                .await
                .map_err(Error::from)?;
            match location {
                Some(location) => {
                    println!("Relay: {}", location.ip);
                    if let Some(hostname) = location.hostname {
                        println!("  Hostname: {}", hostname);
                    }
                    if let Some(city) = location.city {
                        println!("  City: {}", city);
                    }
                    if let Some(country) = location.country {
                        println!("  Country: {}", country);
                    }
                }
                None => println!("Not connected to a relay"),
            }
        }
        Commands::Watch => {
            let mut client = rpc_client(&config).await?;
            client.subscribe().await.map_err(Error::from)?;
            loop {
                match client.next_notification().await.map_err(Error::from)? {
                    Notification::StateChanged { sequence, state } => {
                        println!("[{}] {}", sequence, state)
                    }
                    Notification::Error {
                        sequence,
                        code,
                        message,
                    } => println!("[{}] error {:?}: {}", sequence, code, message),
                }
            }
        }
        Commands::Lan { action } => {
            let mut client = rpc_client(&config).await?;
            match action {
                LanAction::Set { policy } => {
                    client
                        .set_allow_lan(policy == "allow")
                        .await
                        .map_err(Error::from)?;
                    println!("Changed local network sharing setting");
                }
                LanAction::Get => {
                    let allow_lan = client.get_allow_lan().await.map_err(Error::from)?;
                    println!(
                        "Local network sharing setting: {}",
                        if allow_lan { "allow" } else { "block" }
                    );
                }
            }
        }
        Commands::Tunnel {
            action: TunnelAction::Openvpn { action },
        } => {
            let mut client = rpc_client(&config).await?;
            match action {
                OpenVpnAction::Set {
                    option: OpenVpnOption::Mssfix { value },
                } => {
                    let mssfix = parse_mssfix(&value)?;
                    client
                        .set_openvpn_mssfix(mssfix)
                        .await
                        .map_err(Error::from)?;
                    println!("mssfix parameter updated");
                }
                OpenVpnAction::Get => {
                    let options = client.get_tunnel_options().await.map_err(Error::from)?;
                    println!("OpenVPN tunnel options");
                    match options.openvpn.mssfix {
                        Some(mssfix) => println!("  mssfix: {}", mssfix),
                        None => println!("  mssfix: unset"),
                    }
                }
            }
        }
        Commands::Init => {
            info!("Generating default config...");
            let config = Config::default();
            let path = PathBuf::from(LOCAL_CONFIG);
            config.save(&path)?;
            println!("Created default config: {}", LOCAL_CONFIG);
        }
        // Handled before config discovery
        Commands::Plugin { .. } => {}
    }

    Ok(())
}

fn security_settings(
    config: &Config,
    dhcp: Option<&str>,
    lan: Option<&str>,
) -> Result<Option<SecuritySettings>, Error> {
    if dhcp.is_none() && lan.is_none() {
        return Ok(None);
    }
    let flag = |name: &str, value: Option<&str>, default: bool| match value {
        None => Ok(default),
        Some(v) => parse_yes_no(v)
            .ok_or_else(|| Error::InvalidArgument(format!("{} must be yes or no, got {}", name, v))),
    };
    Ok(Some(SecuritySettings {
        permit_dhcp: flag("dhcp", dhcp, config.security.permit_dhcp)?,
        permit_lan: flag("lan", lan, config.security.permit_lan)?,
    }))
}

fn parse_mssfix(value: &str) -> Result<Option<u16>, Error> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| Error::InvalidArgument(format!("mssfix must be 1-65535, got {}", value)))
}

async fn rpc_client(config: &Config) -> Result<RpcClient, Error> {
    let token_file = config
        .token_file()
        .ok_or_else(|| Error::InvalidArgument("no RPC token file configured".to_string()))?;
    let token = read_token_file(&token_file)?;
    Ok(RpcClient::connect(config.rpc.listen, &token).await?)
}

async fn wait_for_outcome(client: &mut RpcClient) -> Result<(), Error> {
    loop {
        match client.next_notification().await? {
            Notification::StateChanged {
                state: state @ TunnelState::Connected { .. },
                ..
            } => {
                print_state(&state);
                return Ok(());
            }
            Notification::StateChanged {
                state: TunnelState::Blocked { reason },
                ..
            } => {
                return Err(match reason {
                    BlockReason::ProcessCrashed(msg) => Error::ProcessCrashed(msg),
                    BlockReason::ProcessSpawnFailed(msg) => Error::ProcessSpawn(msg),
                    BlockReason::PolicyApplyFailed(msg) => Error::PolicyApply(msg),
                    other => Error::RpcTransport(format!("tunnel blocked: {}", other)),
                });
            }
            _ => {}
        }
    }
}

fn print_state(state: &TunnelState) {
    match state {
        TunnelState::Connected {
            relay,
            tunnel_alias,
            dns_servers,
            ..
        } => {
            println!("Tunnel Status: Connected");
            println!("  Relay: {}", relay);
            println!("  Interface: {}", tunnel_alias);
            for server in dns_servers {
                println!("  DNS: {}", server);
            }
        }
        other => println!("Tunnel Status: {}", other),
    }
}
