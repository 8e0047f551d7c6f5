//! Workspace chores driven through `cargo xtask`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

/// Daemon and supervisor executables.
const BINARIES: &[&str] = &["ferret-daemon", "ferret-exec"];

/// The interposer is not executed, it is preloaded; it must land in the same
/// directory as ferret-exec, which resolves `libferret_ld.so` as its own
/// sibling when assembling a job's environment.
const LIBRARIES: &[&str] = &["libferret_ld.so"];

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("install") => install(),
        Some(other) => {
            eprintln!("unknown command: {other}");
            usage()
        }
        None => usage(),
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: cargo xtask install");
    eprintln!();
    eprintln!("  install    build the daemon, the supervisor and the");
    eprintln!("             interposer, then place them side by side in");
    eprintln!("             ~/.cargo/bin");
    ExitCode::FAILURE
}

fn install() -> ExitCode {
    let mut build = Command::new("cargo");
    build.args(["build", "--release", "-p", "ferret-ld"]);
    for bin in BINARIES {
        build.args(["-p", bin]);
    }
    match build.status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            eprintln!("cargo build failed: {status}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("cannot run cargo: {e}");
            return ExitCode::FAILURE;
        }
    }

    // every artifact must exist before anything is copied: a partial
    // install leaves ferret-exec without its sibling interposer
    let built = Path::new("target/release");
    let missing: Vec<&str> = BINARIES
        .iter()
        .chain(LIBRARIES)
        .filter(|name| !built.join(name).is_file())
        .copied()
        .collect();
    if !missing.is_empty() {
        eprintln!("built tree is missing: {}", missing.join(", "));
        return ExitCode::FAILURE;
    }

    let Some(dest) = install_dir() else {
        eprintln!("cannot determine the home directory");
        return ExitCode::FAILURE;
    };
    if let Err(e) = fs::create_dir_all(&dest) {
        eprintln!("cannot create {}: {e}", dest.display());
        return ExitCode::FAILURE;
    }

    for name in BINARIES {
        if let Err(e) = place(built, &dest, name, 0o755) {
            eprintln!("installing {name}: {e}");
            return ExitCode::FAILURE;
        }
    }
    for name in LIBRARIES {
        if let Err(e) = place(built, &dest, name, 0o644) {
            eprintln!("installing {name}: {e}");
            return ExitCode::FAILURE;
        }
    }

    println!(
        "installed {} artifacts into {}",
        BINARIES.len() + LIBRARIES.len(),
        dest.display()
    );
    ExitCode::SUCCESS
}

fn install_dir() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".cargo").join("bin"))
}

/// Copy one artifact and pin its permissions: executables stay executable,
/// the preloaded object does not need to be.
fn place(built: &Path, dest: &Path, name: &str, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let target = dest.join(name);
    fs::copy(built.join(name), &target)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
    println!("  {name} -> {}", target.display());
    Ok(())
}
