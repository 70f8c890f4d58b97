use std::collections::HashMap;
use std::pin::Pin;
use std::process;
use std::sync::{Arc, Mutex};

use clap::Parser;
use colored::*;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use zpcal::batch::BatchController;
use zpcal::calibrate::{CalibParams, Calibrator};
use zpcal::cli::{
    BatchCommand, CalibrateArgs, CalibrateCommand, Cli, Command, ReadTarget, RefDeviceArgs,
    TestDeviceArgs, WriteCommand,
};
use zpcal::config::ConfigStore;
use zpcal::dbase::{decode_tstamp, Database, TSTAMP_SHORT};
use zpcal::events::{CalibrationObserver, RoundInfo, RoundSamples, SummaryInfo, WriteZpInfo};
use zpcal::persist::PersistentCalibrator;
use zpcal::photometer::PhotometerInfo;
use zpcal::reader::{DeviceParams, Reader};
use zpcal::ring::RingBuffer;
use zpcal::writer::{self, Writer};
use zpcal::{Error, Result, Role, Sample};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "zpcal=debug" } else { "zpcal=info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database = Database::new(&cli.database);
    let result = match cli.command {
        Command::Read {
            target,
            num,
            ref_device,
            test_device,
        } => cmd_read(database, target, num, ref_device, test_device).await,
        Command::Calibrate {
            target: CalibrateCommand::Test {
                opts,
                ref_device,
                test_device,
            },
        } => cmd_calibrate(database, opts, ref_device, test_device).await,
        Command::Write {
            target: WriteCommand::Zp {
                zero_point,
                test_device,
            },
        } => cmd_write(database, zero_point, test_device).await,
        Command::Batch { action } => cmd_batch(database, action),
    };
    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// read
// ---------------------------------------------------------------------------

async fn cmd_read(
    database: Database,
    target: ReadTarget,
    num: Option<usize>,
    ref_device: RefDeviceArgs,
    test_device: TestDeviceArgs,
) -> Result<()> {
    let cfg = ConfigStore::open(&database)?;
    let (ref_params, test_params) = match target {
        ReadTarget::Ref => (Some(DeviceParams::from(&ref_device)), None),
        ReadTarget::Test => (None, Some(DeviceParams::from(&test_device))),
        ReadTarget::Both => (
            Some(DeviceParams::from(&ref_device)),
            Some(DeviceParams::from(&test_device)),
        ),
    };
    let mut reader = Reader::new(cfg, ref_params, test_params);
    reader.init().await?;
    let roles = reader.roles().to_vec();
    let mut raw_message = HashMap::new();
    for role in &roles {
        let info = reader.info(*role).await?;
        log_phot_info(*role, &info);
        raw_message.insert(
            *role,
            reader.device(*role).map(|d| d.raw_message).unwrap_or(false),
        );
    }

    let mut stream: Pin<Box<dyn Stream<Item = (Role, Sample)> + Send>> = match target {
        ReadTarget::Both => {
            let s_ref = reader
                .receive(Role::Ref)
                .ok_or_else(|| Error::transport(Role::Ref, "sample queue unavailable"))?;
            let s_test = reader
                .receive(Role::Test)
                .ok_or_else(|| Error::transport(Role::Test, "sample queue unavailable"))?;
            Box::pin(s_ref.merge(s_test))
        }
        ReadTarget::Ref => Box::pin(
            reader
                .receive(Role::Ref)
                .ok_or_else(|| Error::transport(Role::Ref, "sample queue unavailable"))?,
        ),
        ReadTarget::Test => Box::pin(
            reader
                .receive(Role::Test)
                .ok_or_else(|| Error::transport(Role::Test, "sample queue unavailable"))?,
        ),
    };

    let mut seen = 0usize;
    while let Some((role, sample)) = stream.next().await {
        if raw_message.get(&role).copied().unwrap_or(false) {
            info!(
                "{} [{}] f={} Hz, tbox={:?}, tsky={:?} {}",
                role.tag(),
                sample.seq.map(|s| s.to_string()).unwrap_or_default(),
                sample.freq,
                sample.tamb,
                sample.tsky,
                sample.tstamp.format(TSTAMP_SHORT),
            );
        } else {
            debug!("{} f={} Hz", role.tag(), sample.freq);
        }
        seen += 1;
        if num.is_some_and(|n| seen >= n) {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// calibrate test
// ---------------------------------------------------------------------------

async fn cmd_calibrate(
    database: Database,
    opts: CalibrateArgs,
    ref_device: RefDeviceArgs,
    test_device: TestDeviceArgs,
) -> Result<()> {
    let cfg = ConfigStore::open(&database)?;
    let reader = Reader::new(
        cfg,
        Some(DeviceParams::from(&ref_device)),
        Some(DeviceParams::from(&test_device)),
    );
    let params = CalibParams {
        buffer: opts.buffer,
        period: opts.period,
        central: opts.central,
        zp_fict: opts.zp_fict,
        rounds: opts.rounds,
        zp_offset: opts.zp_offset,
        author: opts.author.clone(),
    };
    let persist = opts.persist.unwrap_or(!opts.dry_run) && !opts.dry_run;
    let update = opts.update && !opts.dry_run;
    let calibrator = Calibrator::new(reader, params);

    if persist {
        let mut controller = PersistentCalibrator::new(calibrator, database);
        controller.init().await?;
        log_both_phot_info(controller.calibrator());
        let console = Arc::new(ConsoleObserver::new(controller.calibrator()));
        controller.subscribe(console);
        let zero_point = controller.calibrate().await?;
        print_final_zp(zero_point);
        if update {
            let outcome = controller.write_zp(zero_point).await?;
            report_write(&outcome)
        } else {
            info!("zero point not written to the device (pass --update)");
            Ok(())
        }
    } else {
        let mut calibrator = calibrator;
        calibrator.init().await?;
        log_both_phot_info(&calibrator);
        let console = Arc::new(ConsoleObserver::new(&calibrator));
        calibrator.subscribe(console);
        let zero_point = calibrator.calibrate().await?;
        print_final_zp(zero_point);
        if update {
            let photometer = calibrator
                .reader()
                .photometer(Role::Test)
                .ok_or_else(|| Error::transport(Role::Test, "photometer unavailable"))?;
            let outcome = writer::write_and_verify(&photometer, zero_point).await;
            calibrator.notify_write_zp(&outcome);
            report_write(&outcome)
        } else {
            info!("dry run, nothing persisted or written");
            Ok(())
        }
    }
}

fn print_final_zp(zero_point: f64) {
    println!(
        "{} {}",
        "Final Zero Point:".bold(),
        format!("{zero_point:.2}").bright_green().bold()
    );
}

/// Write-back reporting per the exit-code policy: a verify mismatch logs a
/// critical line but exits zero; a timeout is a failure.
fn report_write(outcome: &WriteZpInfo) -> Result<()> {
    if outcome.ok {
        info!("{}", writer::describe_outcome(outcome));
        return Ok(());
    }
    error!("{}", writer::describe_outcome(outcome));
    if outcome.timeout {
        Err(Error::timeout(Role::Test, "zero point write-back"))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// write zp
// ---------------------------------------------------------------------------

async fn cmd_write(
    database: Database,
    zero_point: f64,
    test_device: TestDeviceArgs,
) -> Result<()> {
    let cfg = ConfigStore::open(&database)?;
    let mut writer = Writer::new(cfg, DeviceParams::from(&test_device));
    writer.init().await?;
    let info = writer.info().await?;
    log_phot_info(Role::Test, &info);
    let outcome = writer.write_zp(zero_point).await?;
    report_write(&outcome)
}

// ---------------------------------------------------------------------------
// batch
// ---------------------------------------------------------------------------

fn cmd_batch(database: Database, action: BatchCommand) -> Result<()> {
    match action {
        BatchCommand::Begin { comment } => {
            let mut ctrl = BatchController::open_db(&database)?;
            let begin = ctrl.open(comment.as_deref())?;
            info!("opening batch {}", begin.format(TSTAMP_SHORT));
            Ok(())
        }
        BatchCommand::End => {
            let mut ctrl = BatchController::open_db(&database)?;
            let (begin, end, count) = ctrl.close()?;
            info!(
                "closing batch [{} - {}] with {} calibrations",
                begin.format(TSTAMP_SHORT),
                end.format(TSTAMP_SHORT),
                count
            );
            Ok(())
        }
        BatchCommand::Purge => {
            let mut ctrl = BatchController::open_db(&database)?;
            let n = ctrl.purge()?;
            info!("purged {n} empty batches");
            Ok(())
        }
        BatchCommand::View => {
            let ctrl = BatchController::open_db(&database)?;
            println!(
                "{:<20} {:<20} {:>10} {:>9}  {}",
                "Begin (UTC)", "End (UTC)", "# Sessions", "Emailed?", "Comment"
            );
            for row in ctrl.view()? {
                println!(
                    "{:<20} {:<20} {:>10} {:>9}  {}",
                    row.begin_tstamp.format(TSTAMP_SHORT).to_string(),
                    row.end_tstamp
                        .map(|t| t.format(TSTAMP_SHORT).to_string())
                        .unwrap_or_else(|| "(open)".to_string()),
                    row.calibrations
                        .map(|n| n.to_string())
                        .unwrap_or_default(),
                    if row.email_sent { "yes" } else { "no" },
                    row.comment.unwrap_or_default(),
                );
            }
            Ok(())
        }
        BatchCommand::Orphan { list } => {
            let ctrl = BatchController::open_db(&database)?;
            let orphans = ctrl.orphan()?;
            info!("{} orphan sessions not belonging to any batch", orphans.len());
            if list {
                for (i, session) in orphans.iter().enumerate() {
                    info!("[{:03}] {}", i + 1, session.format(TSTAMP_SHORT));
                }
            }
            Ok(())
        }
        BatchCommand::Export {
            base_dir,
            all,
            begin_date,
        } => {
            if all {
                let exporter = zpcal::export::Exporter::new(&database, &base_dir, "all", None)?;
                let path = exporter.export_all_summaries()?;
                info!("exported {}", path.display());
                return Ok(());
            }
            let ctrl = BatchController::open_db(&database)?;
            let batch = match begin_date {
                Some(raw) => ctrl.by_date(decode_tstamp(&raw)?)?,
                None => ctrl
                    .view()?
                    .into_iter()
                    .find(|b| b.end_tstamp.is_some()),
            };
            let Some(batch) = batch else {
                info!("no closed batch is available");
                return Ok(());
            };
            let Some(end) = batch.end_tstamp else {
                info!("no closed batch is available");
                return Ok(());
            };
            let prefix = format!(
                "from_{}_to_{}",
                batch.begin_tstamp.format("%Y%m%d"),
                end.format("%Y%m%d")
            );
            let export_dir = base_dir.join(&prefix);
            info!("exporting to directory {}", export_dir.display());
            let exporter = zpcal::export::Exporter::new(
                &database,
                export_dir,
                &prefix,
                Some((batch.begin_tstamp, end)),
            )?;
            for path in exporter.export()? {
                info!("exported {}", path.display());
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Console reporting
// ---------------------------------------------------------------------------

fn log_both_phot_info(calibrator: &Calibrator) {
    for role in Role::ALL {
        if let Some(info) = calibrator.reader().phot_info(role) {
            log_phot_info(role, info);
        }
    }
}

fn log_phot_info(role: Role, info: &PhotometerInfo) {
    info!("{} {:<12}: {}", role.tag(), "NAME", info.name);
    info!("{} {:<12}: {}", role.tag(), "MAC", info.mac);
    info!("{} {:<12}: {}", role.tag(), "MODEL", info.model);
    info!("{} {:<12}: {}", role.tag(), "SENSOR", opt_str(&info.sensor));
    info!("{} {:<12}: {}", role.tag(), "FIRMWARE", opt_str(&info.firmware));
    info!("{} {:<12}: {}", role.tag(), "ZP", fmt_opt(info.zp, 2));
    info!(
        "{} {:<12}: {}",
        role.tag(),
        "FREQ. OFFSET",
        info.freq_offset_or_zero()
    );
    info!("{} {:<12}: {}", role.tag(), "ENDPOINT", opt_str(&info.endpoint));
}

fn opt_str(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "unknown".to_string())
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:.precision$}"),
        None => "none".to_string(),
    }
}

/// Progress reporter subscribed to the calibration events.
struct ConsoleObserver {
    capacity: usize,
    names: HashMap<Role, String>,
    rings: HashMap<Role, Arc<Mutex<RingBuffer>>>,
}

impl ConsoleObserver {
    fn new(calibrator: &Calibrator) -> Self {
        let mut names = HashMap::new();
        let mut rings = HashMap::new();
        for role in Role::ALL {
            names.insert(
                role,
                calibrator
                    .reader()
                    .phot_info(role)
                    .map(|i| i.name.clone())
                    .unwrap_or_default(),
            );
            if let Some(ring) = calibrator.buffer(role) {
                rings.insert(role, ring);
            }
        }
        ConsoleObserver {
            capacity: calibrator.capacity(),
            names,
            rings,
        }
    }

    fn name(&self, role: Role) -> &str {
        self.names.get(&role).map(String::as_str).unwrap_or("")
    }
}

impl CalibrationObserver for ConsoleObserver {
    fn on_reading(&self, role: Role, _sample: &Sample) {
        let Some(ring) = self.rings.get(&role) else {
            return;
        };
        let current = ring.lock().unwrap().len();
        if current < self.capacity {
            info!(
                "{} {:<9} waiting for enough samples, {:03} remaining",
                role.tag(),
                self.name(role),
                self.capacity - current
            );
        }
    }

    fn on_cal_start(&self) {
        info!("calibration starts");
    }

    fn on_round(&self, round: &RoundInfo, _samples: &RoundSamples) {
        for role in Role::ALL {
            if let Some(stats) = round.stats.get(&role) {
                info!(
                    "{} {:<9} round {}/{}: freq = {} Hz, \u{03c3} = {} Hz, mag = {} ({} samples, {:.1} s)",
                    role.tag(),
                    self.name(role),
                    round.current,
                    round.nrounds,
                    fmt_opt(stats.freq, 3),
                    fmt_opt(stats.stdev, 3),
                    fmt_opt(stats.mag, 4),
                    stats.nsamples,
                    stats.duration,
                );
            }
        }
        info!(
            "round {}/{}: \u{0394}mag = {}, ZP = {}",
            round.current,
            round.nrounds,
            fmt_opt(round.mag_diff, 4),
            fmt_opt(round.zero_point, 2),
        );
    }

    fn on_summary(&self, summary: &SummaryInfo) {
        info!(
            "REF. best freq = {:.3} Hz ({}), best mag = {:.4}",
            summary.best_ref_freq, summary.best_ref_freq_method, summary.best_ref_mag
        );
        info!(
            "TEST best freq = {:.3} Hz ({}), best mag = {:.4}",
            summary.best_test_freq, summary.best_test_freq_method, summary.best_test_mag
        );
        info!(
            "best ZP = {:.2} ({}), final ZP = {:.2}",
            summary.best_zero_point, summary.best_zero_point_method, summary.final_zero_point
        );
    }

    fn on_cal_end(&self) {
        info!("calibration ends");
    }

    fn on_write_zp(&self, outcome: &WriteZpInfo) {
        info!(
            "ZP write-back: sent {:.2}, stored {}, ok = {}",
            outcome.zero_point,
            fmt_opt(outcome.stored, 2),
            outcome.ok
        );
    }
}
