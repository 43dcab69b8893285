//! Server configuration parsed from CLI flags with environment fallbacks.

use clap::Parser;

/// CLI arguments for the Hiroba server binary
#[derive(Parser, Debug, Clone)]
#[command(name = "hiroba-server")]
#[command(about = "Hiroba real-time communication server", long_about = None)]
pub struct Config {
    /// Host address to bind the server to
    #[arg(short = 'H', long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Public IP advertised for NAT 1:1 traversal of the media relay
    #[arg(long, env = "PUBLIC_IP", default_value = "")]
    pub public_ip: String,

    /// STUN server handed to peer connections
    #[arg(
        long,
        env = "STUN_SERVER",
        default_value = "stun:stun.l.google.com:19302"
    )]
    pub stun_server: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_ip: String::new(),
            stun_server: "stun:stun.l.google.com:19302".to_string(),
        }
    }
}
