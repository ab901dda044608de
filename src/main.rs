fn main() -> std::process::ExitCode {
    vnc_recorder_lib::run()
}
