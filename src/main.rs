fn main() {
    steamvet::run();
}
