use std::env;
use std::process::Command;

fn main() {
    // This allows using #[cfg(sqlite)] instead of #[cfg(feature = "sqlite")], which helps when trying to add them through macros
    #[cfg(feature = "sqlite")]
    println!("cargo:rustc-cfg=sqlite");
    #[cfg(feature = "mysql")]
    println!("cargo:rustc-cfg=mysql");
    #[cfg(feature = "postgresql")]
    println!("cargo:rustc-cfg=postgresql");

    println!("cargo::rustc-check-cfg=cfg(sqlite)");
    println!("cargo::rustc-check-cfg=cfg(mysql)");
    println!("cargo::rustc-check-cfg=cfg(postgresql)");

    #[cfg(not(any(feature = "sqlite", feature = "mysql", feature = "postgresql")))]
    compile_error!(
        "You need to enable one DB backend. To build with previous defaults do: cargo build --features sqlite"
    );

    // Stamp the build: an explicit GG_VERSION wins, otherwise whatever
    // `git describe` says about the checkout. Without either, the crate
    // version cargo already bakes in is used as-is.
    if let Some(version) = env::var("GG_VERSION").ok().or_else(git_describe) {
        println!("cargo:rustc-env=GG_VERSION={version}");
    }
}

fn git_describe() -> Option<String> {
    let out = Command::new("git").args(["describe", "--tags", "--always", "--dirty=+"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let version = String::from_utf8(out.stdout).ok()?.trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
