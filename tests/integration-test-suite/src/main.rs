//! Integration test suite for Wuild
//!
//! Tests are run via `cargo test`.

fn main() {
    println!("Integration test suite for Wuild");
}
