//! Print the control-plane request a configuration produces
//!
//! Usage: uapi-request <CONFIG|->

use std::process::ExitCode;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use wiresocks::app::Plan;
use wiresocks::config::ConfigSource;

fn main() -> ExitCode {
    let Some(arg) = std::env::args().nth(1) else {
        eprintln!("Usage: uapi-request <CONFIG|->");
        return ExitCode::from(2);
    };

    let plan = match Plan::load_blocking(&ConfigSource::from_arg(&arg)) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            return ExitCode::from(e.exit_code());
        }
    };

    eprintln!("=== {} ===", arg);
    if let Some(peer) = plan.config.active_peer() {
        eprintln!("  Peer public key: {}", BASE64.encode(peer.public_key.as_bytes()));
    }
    eprintln!("  Addresses: {:?}", plan.settings.addresses);
    eprintln!("  DNS: {:?}", plan.settings.dns);
    eprintln!("  MTU: {}", plan.settings.mtu);
    if plan.config.peers.len() > 1 {
        eprintln!("  Ignored peers: {}", plan.config.peers.len() - 1);
    }

    println!("{}", plan.request);
    ExitCode::SUCCESS
}
