// File: ./src/cli.rs
//! Shared command-line interface logic, like printing help.

pub fn print_help(binary_name: &str) {
    println!(
        "reveil {} - multi-alarm scheduling engine daemon",
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("USAGE:");
    println!("  {} [OPTIONS]", binary_name);
    println!("  {} diagnostics      Print a diagnostics snapshot and exit", binary_name);
    println!();
    println!("OPTIONS:");
    println!("  -r, --root <dir>    Override the data/config root directory");
    println!("  -h, --help          Show this help");
    println!();
    println!("The daemon reads device defaults from config.toml in the config");
    println!("directory and persists alarms in alarms.json in the data directory.");
    println!("Lifecycle events are written to the log as they are emitted.");
}
