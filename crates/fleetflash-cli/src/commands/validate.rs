//! Validate command - checks a network plan and prints the role table

use anyhow::Result;
use console::style;
use fleetflash_core::{validate, NetworkConfig};

use crate::NetworkArgs;

/// Validate the network arguments
pub fn network_config(args: &NetworkArgs) -> Result<NetworkConfig> {
    Ok(validate(&args.gw, &args.dns, &args.manager, args.nodes)?)
}

/// Execute the validate command
pub fn execute(args: &NetworkArgs, quiet: bool) -> Result<()> {
    let network = network_config(args)?;
    if quiet {
        return Ok(());
    }

    println!("{} Network plan is valid\n", style("✓").green().bold());
    print_plan(&network);
    Ok(())
}

/// Print the gateway, DNS and the address of every role
pub fn print_plan(network: &NetworkConfig) {
    println!("  {} {}", style("Gateway:").bold(), network.gateway());
    println!("  {} {}", style("DNS:    ").bold(), network.dns_csv());
    println!("  {} {}", style("Manager:").bold(), network.manager());
    println!("  {} {}", style("Nodes:  ").bold(), network.node_count());
    println!();

    for role in network.roles() {
        println!(
            "    {:<10} {}",
            style(role.nick()).cyan(),
            network.role_ip(role)
        );
    }
}
