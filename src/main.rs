fn main() {
    tend::cli::entrypoint();
}
