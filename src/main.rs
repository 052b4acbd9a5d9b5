use snapsrv::coord::{self, CoordConfig, Coordinator, CriuSpawner, CONTROL_FD, STATUS_FD};
use snapsrv::exits;
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "snapsrv",
    about = "AFL forkserver that restores a CRIU checkpoint of the target for every run."
)]
struct Settings {
    /// Engine's sync directory of the target, holds .cur_input, stdout and stderr.
    #[structopt(parse(from_os_str))]
    sync_dir: PathBuf,
    /// Directory with the checkpoint images.
    #[structopt(parse(from_os_str))]
    checkpoint_dir: PathBuf,
    /// Path to criu.
    #[structopt(long, default_value = "criu", parse(from_os_str))]
    criu: PathBuf,
    /// Restore log, written into the checkpoint directory.
    #[structopt(long, default_value = "restore.log")]
    restore_log: String,
    /// Criu log level.
    #[structopt(long, default_value = "4")]
    criu_log_level: u8,
    /// Log every iteration.
    #[structopt(short, long)]
    verbose: bool,
}

fn main() {
    let settings = Settings::from_args();
    snapsrv::utils::log::init(settings.verbose);

    let config = CoordConfig {
        sync_dir: settings.sync_dir,
        checkpoint_dir: settings.checkpoint_dir,
        criu: settings.criu,
        restore_log: settings.restore_log,
        log_level: settings.criu_log_level,
    };
    if let Err(e) = config.check() {
        exits!(e.exit_code(), "snapsrv: {}", e);
    }
    let pid_pipe = match coord::setup(&config) {
        Ok(f) => f,
        Err(e) => exits!(e.exit_code(), "snapsrv: setup: {}", e),
    };
    log::info!(
        "serving restores of '{}' for '{}'",
        config.checkpoint_dir.display(),
        config.sync_dir.display()
    );

    let (control, status) = unsafe { (File::from_raw_fd(CONTROL_FD), File::from_raw_fd(STATUS_FD)) };
    let mut coordinator = Coordinator::new(control, status, CriuSpawner::new(config, pid_pipe));
    let err = coordinator.run();
    exits!(
        err.exit_code(),
        "snapsrv: {} (after {} iterations)",
        err,
        coordinator.iterations()
    )
}
