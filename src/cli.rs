//! Command-line surface. Every option maps 1-to-1 onto a configuration key;
//! an explicit option always wins over the stored value.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::reader::DeviceParams;
use crate::{CentralTendency, Model};

#[derive(Parser)]
#[command(name = "zpcal")]
#[command(version)]
#[command(about = "Zero-point calibration tool for TESS-W light-pollution photometers")]
pub struct Cli {
    /// SQLite database holding configuration and calibration records
    #[arg(long, value_name = "PATH", env = "ZPCAL_DATABASE", default_value = "zpcal.db", global = true)]
    pub database: PathBuf,

    /// Verbose logging (RUST_LOG takes precedence when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReadTarget {
    Ref,
    Test,
    Both,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read photometer samples without calibrating
    Read {
        #[arg(value_enum)]
        target: ReadTarget,

        /// Stop after this many samples
        #[arg(long, short)]
        num: Option<usize>,

        #[command(flatten)]
        ref_device: RefDeviceArgs,

        #[command(flatten)]
        test_device: TestDeviceArgs,
    },

    /// Calibrate a photometer against the reference
    Calibrate {
        #[command(subcommand)]
        target: CalibrateCommand,
    },

    /// Write values to the test photometer
    Write {
        #[command(subcommand)]
        target: WriteCommand,
    },

    /// Manage calibration batches
    Batch {
        #[command(subcommand)]
        action: BatchCommand,
    },
}

#[derive(Subcommand)]
pub enum CalibrateCommand {
    /// Calibrate the test photometer
    Test {
        #[command(flatten)]
        opts: CalibrateArgs,

        #[command(flatten)]
        ref_device: RefDeviceArgs,

        #[command(flatten)]
        test_device: TestDeviceArgs,
    },
}

#[derive(Subcommand)]
pub enum WriteCommand {
    /// Write a zero point, then read it back to verify
    Zp {
        /// Zero point to write
        zero_point: f64,

        #[command(flatten)]
        test_device: TestDeviceArgs,
    },
}

#[derive(Subcommand)]
pub enum BatchCommand {
    /// Begin a new calibration batch
    Begin {
        /// Batch comment
        #[arg(long)]
        comment: Option<String>,
    },
    /// End the current calibration batch
    End,
    /// Delete closed batches with no calibrations
    Purge,
    /// List calibration batches
    View,
    /// Show calibration sessions not contained in any closed batch
    Orphan {
        /// List each orphan session
        #[arg(long)]
        list: bool,
    },
    /// Export batch calibrations to delimited text files
    Export {
        /// Directory where export folders are created
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,

        /// Export every photometer's latest summary instead of a batch
        #[arg(long)]
        all: bool,

        /// Select the closed batch begun at this instant (YYYY-MM-DDTHH:MM:SS)
        #[arg(long, value_name = "TSTAMP", conflicts_with = "all")]
        begin_date: Option<String>,
    },
}

#[derive(Args)]
pub struct CalibrateArgs {
    /// Run the protocol without persisting or writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Write the final zero point back to the test photometer
    #[arg(long, short)]
    pub update: bool,

    /// Persist the calibration record (defaults to true unless --dry-run)
    #[arg(long, value_name = "BOOL")]
    pub persist: Option<bool>,

    /// Ring buffer capacity in samples
    #[arg(long, short, value_name = "N")]
    pub buffer: Option<usize>,

    /// Central tendency estimator for ring statistics
    #[arg(long, value_enum)]
    pub central: Option<CentralTendency>,

    /// Number of calibration rounds
    #[arg(long, short, value_name = "N")]
    pub rounds: Option<usize>,

    /// Seconds between rounds
    #[arg(long, short, value_name = "SECONDS")]
    pub period: Option<f64>,

    /// Fictitious zero point used to derive instrumental magnitudes
    #[arg(long, value_name = "ZP")]
    pub zp_fict: Option<f64>,

    /// Additive correction applied to the best zero point
    #[arg(long, value_name = "ZP")]
    pub zp_offset: Option<f64>,

    /// Person performing the calibration
    #[arg(long)]
    pub author: Option<String>,
}

#[derive(Args)]
pub struct RefDeviceArgs {
    /// Reference photometer endpoint (tcp://host:port or udp://host:port)
    #[arg(long, value_name = "URL")]
    pub ref_endpoint: Option<String>,

    /// Reference photometer model
    #[arg(long, value_enum)]
    pub ref_model: Option<Model>,

    /// Reference photometer sensor
    #[arg(long, value_name = "NAME")]
    pub ref_sensor: Option<String>,

    /// Reference unit speaks the old wire protocol
    #[arg(long, value_name = "BOOL")]
    pub ref_old_proto: Option<bool>,

    /// Log every raw reference sample
    #[arg(long)]
    pub ref_raw_message: bool,
}

#[derive(Args)]
pub struct TestDeviceArgs {
    /// Test photometer endpoint (tcp://host:port or udp://host:port)
    #[arg(long, value_name = "URL")]
    pub test_endpoint: Option<String>,

    /// Test photometer model
    #[arg(long, value_enum)]
    pub test_model: Option<Model>,

    /// Test photometer sensor
    #[arg(long, value_name = "NAME")]
    pub test_sensor: Option<String>,

    /// Test unit speaks the old wire protocol
    #[arg(long, value_name = "BOOL")]
    pub test_old_proto: Option<bool>,

    /// Log every raw test sample
    #[arg(long)]
    pub test_raw_message: bool,
}

impl From<&RefDeviceArgs> for DeviceParams {
    fn from(args: &RefDeviceArgs) -> Self {
        DeviceParams {
            model: args.ref_model,
            sensor: args.ref_sensor.clone(),
            endpoint: args.ref_endpoint.clone(),
            old_proto: args.ref_old_proto,
            raw_message: args.ref_raw_message,
        }
    }
}

impl From<&TestDeviceArgs> for DeviceParams {
    fn from(args: &TestDeviceArgs) -> Self {
        DeviceParams {
            model: args.test_model,
            sensor: args.test_sensor.clone(),
            endpoint: args.test_endpoint.clone(),
            old_proto: args.test_old_proto,
            raw_message: args.test_raw_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_both() {
        let cli = Cli::parse_from(["zpcal", "read", "both", "--num", "10"]);
        match cli.command {
            Command::Read { target, num, .. } => {
                assert_eq!(target, ReadTarget::Both);
                assert_eq!(num, Some(10));
            }
            _ => panic!("expected read command"),
        }
    }

    #[test]
    fn test_parse_calibrate_defaults() {
        let cli = Cli::parse_from(["zpcal", "calibrate", "test"]);
        match cli.command {
            Command::Calibrate {
                target: CalibrateCommand::Test { opts, .. },
            } => {
                assert!(!opts.dry_run);
                assert!(!opts.update);
                assert_eq!(opts.persist, None);
                assert_eq!(opts.buffer, None);
                assert_eq!(opts.rounds, None);
            }
            _ => panic!("expected calibrate test"),
        }
    }

    #[test]
    fn test_parse_calibrate_full_flags() {
        let cli = Cli::parse_from([
            "zpcal",
            "calibrate",
            "test",
            "--dry-run",
            "--buffer",
            "9",
            "--central",
            "mode",
            "--rounds",
            "3",
            "--period",
            "0.5",
            "--zp-fict",
            "20.5",
            "--zp-offset",
            "0.2",
            "--author",
            "RGB",
            "--ref-endpoint",
            "udp://0.0.0.0:2255",
            "--test-endpoint",
            "tcp://192.168.4.1:23",
            "--test-old-proto",
            "false",
        ]);
        match cli.command {
            Command::Calibrate {
                target:
                    CalibrateCommand::Test {
                        opts,
                        ref_device,
                        test_device,
                    },
            } => {
                assert!(opts.dry_run);
                assert_eq!(opts.buffer, Some(9));
                assert_eq!(opts.central, Some(CentralTendency::Mode));
                assert_eq!(opts.rounds, Some(3));
                assert_eq!(opts.period, Some(0.5));
                assert_eq!(opts.zp_fict, Some(20.5));
                assert_eq!(opts.zp_offset, Some(0.2));
                assert_eq!(opts.author.as_deref(), Some("RGB"));
                assert_eq!(ref_device.ref_endpoint.as_deref(), Some("udp://0.0.0.0:2255"));
                assert_eq!(test_device.test_endpoint.as_deref(), Some("tcp://192.168.4.1:23"));
                assert_eq!(test_device.test_old_proto, Some(false));
            }
            _ => panic!("expected calibrate test"),
        }
    }

    #[test]
    fn test_parse_write_zp() {
        let cli = Cli::parse_from(["zpcal", "write", "zp", "19.62"]);
        match cli.command {
            Command::Write {
                target: WriteCommand::Zp { zero_point, .. },
            } => assert_eq!(zero_point, 19.62),
            _ => panic!("expected write zp"),
        }
    }

    #[test]
    fn test_parse_batch_begin_with_comment() {
        let cli = Cli::parse_from(["zpcal", "batch", "begin", "--comment", "June run"]);
        match cli.command {
            Command::Batch {
                action: BatchCommand::Begin { comment },
            } => assert_eq!(comment.as_deref(), Some("June run")),
            _ => panic!("expected batch begin"),
        }
    }

    #[test]
    fn test_parse_batch_export_all() {
        let cli = Cli::parse_from(["zpcal", "batch", "export", "--all", "--base-dir", "/tmp/x"]);
        match cli.command {
            Command::Batch {
                action:
                    BatchCommand::Export {
                        base_dir,
                        all,
                        begin_date,
                    },
            } => {
                assert!(all);
                assert_eq!(base_dir, PathBuf::from("/tmp/x"));
                assert!(begin_date.is_none());
            }
            _ => panic!("expected batch export"),
        }
    }

    #[test]
    fn test_parse_database_flag_is_global() {
        let cli = Cli::parse_from(["zpcal", "batch", "view", "--database", "/tmp/cal.db"]);
        assert_eq!(cli.database, PathBuf::from("/tmp/cal.db"));
    }

    #[test]
    fn test_device_params_from_ref_args() {
        let cli = Cli::parse_from([
            "zpcal",
            "read",
            "ref",
            "--ref-endpoint",
            "udp://0.0.0.0:2255",
            "--ref-raw-message",
        ]);
        match cli.command {
            Command::Read { ref_device, .. } => {
                let params = DeviceParams::from(&ref_device);
                assert_eq!(params.endpoint.as_deref(), Some("udp://0.0.0.0:2255"));
                assert!(params.raw_message);
                assert_eq!(params.model, None);
            }
            _ => panic!("expected read command"),
        }
    }
}
