fn main() {
    if let Err(err) = pve_zsync_manager::cli::run() {
        println!("{:#}", err);
        std::process::exit(1);
    }
}
