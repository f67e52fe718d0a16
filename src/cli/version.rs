/// Display version information
pub fn execute() {
    println!("rentguard {}", env!("CARGO_PKG_VERSION"));
    println!("Client-side access control for the rental marketplace");
}
