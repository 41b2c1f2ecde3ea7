//! TCP server for OakDB
//!
//! Line-oriented protocol: one SQL statement per line, one formatted
//! response per statement. Each connection gets its own session thread;
//! recovery has already run by the time the listener accepts anyone.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{error, info};

use crate::db::Db;
use crate::error::Result;
use crate::executor::QueryResult;

/// Default server port
pub const DEFAULT_PORT: u16 = 7170;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// OakDB TCP server
pub struct Server {
    config: ServerConfig,
    db: Arc<Db>,
}

impl Server {
    pub fn new(config: ServerConfig, db: Arc<Db>) -> Self {
        Self { config, db }
    }

    /// Listen for connections, one worker thread per session.
    pub fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address())?;
        info!("oakdb server listening on {}", self.config.bind_address());

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let db = self.db.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, db) {
                            error!("connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, db: Arc<Db>) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("client connected: {}", peer);

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut session = db.session();

    send(&mut writer, "OakDB server ready.\n")?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "exit;") {
            send(&mut writer, "bye\n")?;
            break;
        }

        let response = match session.execute(query) {
            Ok(result) => format_result(&result),
            Err(e) => format!("Error: {}\n", e),
        };
        send(&mut writer, &response)?;
    }

    // A dropped connection mid-transaction rolls back like a client abort.
    if session.in_transaction() {
        session.execute("abort;").ok();
    }
    info!("client disconnected: {}", peer);
    Ok(())
}

fn send(writer: &mut TcpStream, message: &str) -> Result<()> {
    writer.write_all(message.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Format a query result as an ASCII table (or its message).
pub fn format_result(result: &QueryResult) -> String {
    if let Some(message) = &result.message {
        return format!("{}\n", message);
    }
    if result.columns.is_empty() {
        return format!("{} row(s) affected\n", result.affected_rows);
    }

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(value.to_string().len());
        }
    }

    let separator: String = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut output = String::new();
    output.push_str(&separator);
    let header: String = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&separator);

    for row in &result.rows {
        let row_str: String = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v.to_string(), width = *w))
            .collect::<Vec<_>>()
            .join("|");
        output.push_str(&format!("|{}|\n", row_str));
    }
    output.push_str(&separator);
    output.push_str(&format!("{} row(s) returned\n", result.rows.len()));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::Value;

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new().host("0.0.0.0").port(5500);
        assert_eq!(config.bind_address(), "0.0.0.0:5500");
    }

    #[test]
    fn test_format_message() {
        let result = QueryResult::with_message("Table 't' created");
        assert_eq!(format_result(&result), "Table 't' created\n");
    }

    #[test]
    fn test_format_rows() {
        let result = QueryResult {
            columns: vec!["id".to_string(), "v".to_string()],
            rows: vec![
                vec![Value::Int(1), Value::Str("aa".to_string())],
                vec![Value::Int(2), Value::Str("bb".to_string())],
            ],
            affected_rows: 0,
            message: None,
        };
        let out = format_result(&result);
        assert!(out.contains("| id | v  |"));
        assert!(out.contains("2 row(s) returned"));
    }
}
