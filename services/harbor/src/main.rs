use clap::{App, Arg};
use plinth::logging;

use gantry::config::NodeConfig;
use gantry::node::Node;

mod core;
mod protocol;
mod transaction;

fn main() {
    let matches = App::new("Harbor")
        .version("0.1.0")
        .about("Runs a file sharing node.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = NodeConfig::load(config_path).expect("Error loading config file");

    let log = match config.log.level.severity() {
        Some(severity) => logging::init(severity).expect("Error building logger"),
        None => logging::discard(),
    };

    let mut node = Node::new(config, log.clone());

    protocol::register_all(&mut node).expect("Error registering protocol messages");

    let files = crate::core::FileStore::shared();
    transaction::register_all(&mut node, files).expect("Error registering transactions");

    logging::info!(log, "starting harbor node");
    node.run().expect("Error running node");
}
