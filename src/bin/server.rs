use std::env;

use oakdb::db::Db;
use oakdb::server::{Server, ServerConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = ServerConfig::new();
    let mut data_dir = "oakdb_data".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if let Some(port) = args.get(i + 1).and_then(|p| p.parse().ok()) {
                    config = config.port(port);
                }
                i += 2;
            }
            "--dir" | "-d" => {
                if let Some(dir) = args.get(i + 1) {
                    data_dir = dir.clone();
                }
                i += 2;
            }
            _ => i += 1,
        }
    }

    let db = match Db::open(&data_dir) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database in '{}': {}", data_dir, e);
            std::process::exit(1);
        }
    };

    println!("OakDB serving '{}' on {}", data_dir, config.bind_address());
    let server = Server::new(config, db);
    if let Err(e) = server.start() {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
