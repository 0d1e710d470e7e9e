fn main() {
    println!("Battlegrid - LAN Battleship");
    println!();
    println!("Usage:");
    println!("  Start the lobby server:   cargo run --bin server [-- <port>]");
    println!("  Connect a client:         cargo run --bin client [-- <address> [port]]");
    println!();
    println!("The server listens on port 6683 by default.");
    println!("Log in on two clients and use !connect to start a match.");
}
