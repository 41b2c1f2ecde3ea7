//! OakDB - interactive shell
//!
//! Opens a database directory directly and runs a read-eval-print loop
//! against a local session.

use std::env;
use std::io::{self, BufRead, Write};

use oakdb::db::Db;
use oakdb::server::format_result;

fn print_banner() {
    println!(
        r#"
  ___        _    ____  ____
 / _ \  __ _| | _|  _ \| __ )
| | | |/ _` | |/ / | | |  _ \
| |_| | (_| |   <| |_| | |_) |
 \___/ \__,_|_|\_\____/|____/

 A single-node relational storage engine in Rust
 Type 'help;' for help, 'exit' to leave
"#
    );
}

fn main() {
    env_logger::init();

    let data_dir = env::args().nth(1).unwrap_or_else(|| "oakdb_data".to_string());
    let db = match Db::open(&data_dir) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database in '{}': {}", data_dir, e);
            std::process::exit(1);
        }
    };
    let mut session = db.session();

    print_banner();

    let stdin = io::stdin();
    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "oakdb> " } else { "  ...> " };
        print!("{}", prompt);
        io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                continue;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        buffer.push_str(&line);

        // Statements end with a semicolon; `exit` stands alone.
        let stmt = buffer.trim();
        if matches!(stmt, "exit" | "exit;") {
            break;
        }
        if !stmt.ends_with(';') {
            continue;
        }
        let sql = buffer.clone();
        buffer.clear();

        match session.execute(&sql) {
            Ok(result) => print!("{}", format_result(&result)),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    if session.in_transaction() {
        session.execute("abort;").ok();
    }
    db.close().ok();
    println!("bye");
}
