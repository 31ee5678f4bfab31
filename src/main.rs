fn main() {
    if let Err(e) = lis_lib::run() {
        eprintln!("lis-server: {e}");
        std::process::exit(1);
    }
}
