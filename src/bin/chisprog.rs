use std::fs::File;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info};
use structopt::StructOpt;

use rand::rngs::StdRng;
use rand::SeedableRng;

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use chisprog::{Device, Event, Job, QaConfig, Supervisor};

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, StructOpt)]
enum Operations {
    /// List attached SuperChis devices
    Scan,

    /// Run the QA suite against one device
    Qa {
        port: String,
        #[structopt(long)]
        sram_basic: bool,
        #[structopt(long)]
        sram_full: bool,
        #[structopt(long)]
        flash_erase_blank: bool,
        #[structopt(long)]
        flash_fast: bool,
        #[structopt(long)]
        ppb_unlock: bool,
        #[structopt(long)]
        backup_flash_probe: bool,
    },

    /// Run the QA suite against every attached device
    QaAll {
        #[structopt(long)]
        sram_basic: bool,
        #[structopt(long)]
        sram_full: bool,
        #[structopt(long)]
        flash_erase_blank: bool,
        #[structopt(long)]
        flash_fast: bool,
        #[structopt(long)]
        ppb_unlock: bool,
        #[structopt(long)]
        backup_flash_probe: bool,
    },

    /// Program a ROM image onto one device
    Production { port: String, rom_file: String },

    /// Program a ROM image onto every attached device
    ProductionAll { rom_file: String },

    /// Blank the NOR metadata window on one device
    ResetNor { port: String },

    /// Blank the NOR metadata window on every attached device
    ResetNorAll,

    /// Back up ROM contents from one device to a file
    Backup {
        port: String,
        out_file: String,
        #[structopt(long, default_value = "134217728")]
        size: u64,
    },
}

fn qa_config(
    sram_basic: bool,
    sram_full: bool,
    flash_erase_blank: bool,
    flash_fast: bool,
    ppb_unlock: bool,
    backup_flash_probe: bool,
) -> QaConfig {
    let mut cfg = QaConfig::new();
    cfg.set_sram_basic(sram_basic);
    cfg.set_sram_full(sram_full);
    cfg.set_flash_erase_blank(flash_erase_blank);
    cfg.set_flash_fast(flash_fast);
    cfg.set_ppb_unlock(ppb_unlock);
    cfg.set_backup_flash_probe(backup_flash_probe);
    cfg
}

fn print_event(event: &Event) {
    match event {
        Event::Log { port, message } => info!("[{}] {}", port, message),
        Event::Progress { port, pct } => info!("[{}] {}%", port, pct),
        Event::Finished { port, ok } => {
            if *ok {
                info!("[{}] finished", port);
            } else {
                error!("[{}] failed", port);
            }
        }
    }
}

fn connected_device(port: &str) -> std::io::Result<Device> {
    let mut device = Device::new(port.to_string());
    device.connect()?;
    Ok(device)
}

fn run_single(port: &str, job: Job) -> Result<bool, Box<dyn std::error::Error>> {
    let device = connected_device(port)?;
    let (tx, rx) = chisprog::events::channel();
    let mut sup = Supervisor::new(tx);
    sup.add_device(device);

    sup.start(&port.to_string(), job)
        .map_err(|e| format!("{:?}", e))?;

    let mut ok = false;
    loop {
        match rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(event) => {
                if let Event::Finished { ok: job_ok, .. } = &event {
                    ok = *job_ok;
                }
                print_event(&event);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                sup.reap_finished();
                if sup.active_job_count() == 0 {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    sup.shutdown();
    Ok(ok)
}

fn run_all(job_for: impl Fn() -> Job) -> Result<(), Box<dyn std::error::Error>> {
    let ports = chisprog::transport::matching_ports()?;
    let (tx, rx) = chisprog::events::channel();
    let mut sup = Supervisor::new(tx);
    for port in &ports {
        match connected_device(port) {
            Ok(device) => sup.add_device(device),
            Err(e) => error!("{}: failed to connect: {}", port, e),
        }
    }

    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    sup.start_all(job_for, &mut rng);

    loop {
        match rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(event) => print_event(&event),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                sup.reap_finished();
                if sup.active_job_count() == 0 {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    sup.shutdown();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Options::from_args();
    TermLogger::init(opts.log_level, simplelog::Config::default(), TerminalMode::Mixed)?;

    match opts.operation {
        Operations::Scan => {
            for port in chisprog::transport::matching_ports()? {
                println!("{}", port);
            }
        }
        Operations::Qa {
            port,
            sram_basic,
            sram_full,
            flash_erase_blank,
            flash_fast,
            ppb_unlock,
            backup_flash_probe,
        } => {
            let cfg = qa_config(
                sram_basic,
                sram_full,
                flash_erase_blank,
                flash_fast,
                ppb_unlock,
                backup_flash_probe,
            );
            let ok = run_single(&port, Job::Qa(cfg))?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Operations::QaAll {
            sram_basic,
            sram_full,
            flash_erase_blank,
            flash_fast,
            ppb_unlock,
            backup_flash_probe,
        } => {
            run_all(move || {
                Job::Qa(qa_config(
                    sram_basic,
                    sram_full,
                    flash_erase_blank,
                    flash_fast,
                    ppb_unlock,
                    backup_flash_probe,
                ))
            })?;
        }
        Operations::Production { port, rom_file } => {
            let image = std::fs::read(&rom_file)?;
            let ok = run_single(&port, Job::Production(image))?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Operations::ProductionAll { rom_file } => {
            let image = std::fs::read(&rom_file)?;
            run_all(move || Job::Production(image.clone()))?;
        }
        Operations::ResetNor { port } => {
            let ok = run_single(&port, Job::ResetNor)?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Operations::ResetNorAll => {
            run_all(|| Job::ResetNor)?;
        }
        Operations::Backup { port, out_file, size } => {
            let file = File::create(&out_file)?;
            let ok = run_single(&port, Job::Backup { size, sink: Box::new(file) })?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}
