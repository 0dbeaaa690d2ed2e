fn main() {
    if let Err(e) = call_session_lib::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
