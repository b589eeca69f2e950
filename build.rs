fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_arch = "x86_64") && cfg!(target_env = "gnu")) {
        panic!(
            "{} only works with linux using glibc on x86_64",
            env!("CARGO_PKG_NAME")
        );
    }

    // analysis modules are opened with global binding and may resolve
    // symbols exported by the tracer itself
    println!("cargo:rustc-link-arg=-Wl,--export-dynamic");
}
