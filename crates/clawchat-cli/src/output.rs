//! CLI output: exactly one JSON value per invocation.

use serde_json::{json, Value};

/// Prints the success value to stdout.
pub fn print_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

/// Prints an error object to stdout; the caller exits nonzero.
pub fn print_error(message: &str) {
    println!("{}", json!({ "error": message }));
}
