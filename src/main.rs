fn main() {
    owlivion_sync_engine::run()
}
