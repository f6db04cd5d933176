use super::*;

use clap::error::ErrorKind;
use keystone_core::InstallScope;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("ksinstall").chain(args.iter().copied()))
        .expect("must parse")
}

fn config_for(args: &[&str]) -> InstallerConfig {
    let cli = parse(args);
    let layout = InstallLayout::for_root(cli.root.clone().unwrap_or_else(|| PathBuf::from("/")))
        .expect("must build layout");
    build_config(
        &cli,
        layout,
        PathBuf::from("/Users/alice/"),
        501,
        KeystoneSettings::default(),
    )
}

#[test]
fn exactly_one_operation_is_required() {
    let err = Cli::try_parse_from(["ksinstall", "--force"]).expect_err("must require operation");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

    let err = Cli::try_parse_from(["ksinstall", "--uninstall", "--nuke"])
        .expect_err("must reject two operations");
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
}

#[test]
fn operation_flags_map_to_operations() {
    assert_eq!(
        parse(&["--install", "/tmp/Keystone.tbz"]).operation(),
        Some(Operation::Install)
    );
    assert_eq!(parse(&["--uninstall"]).operation(), Some(Operation::Uninstall));
    assert_eq!(parse(&["--nuke"]).operation(), Some(Operation::Nuke));
    assert_eq!(
        parse(&["--remove-receipts"]).operation(),
        Some(Operation::RemoveReceipts)
    );

    let cli = parse(&["--record-activity", "com.google.Chrome"]);
    assert_eq!(cli.operation(), None);
    assert_eq!(cli.record_activity.as_deref(), Some("com.google.Chrome"));
}

#[test]
fn no_launchd_implies_no_job_control() {
    let config = config_for(&["--install", "/tmp/Keystone.tbz", "--no-launchd"]);
    assert!(!config.write_job_descriptors);
    assert!(!config.control_jobs);

    let config = config_for(&["--install", "/tmp/Keystone.tbz", "--no-launchdjobs"]);
    assert!(config.write_job_descriptors);
    assert!(!config.control_jobs);
}

#[test]
fn modifiers_flow_into_installer_config() {
    let config = config_for(&[
        "--install",
        "/tmp/Keystone.tbz",
        "--root",
        "/Users/alice",
        "--self-destruct",
        "--force",
        "--tiger",
        "--lockdown",
        "--interval",
        "600",
    ]);
    assert_eq!(config.package, Some(PathBuf::from("/tmp/Keystone.tbz")));
    assert_eq!(config.layout.scope(), InstallScope::User);
    assert!(config.self_destruct);
    assert!(config.force);
    assert!(config.simulate_legacy_host);
    assert!(config.lockdown);
    assert_eq!(config.start_interval, 600);
    assert_eq!(config.invoking_uid, 501);

    let config = config_for(&["--uninstall", "--root", "/"]);
    assert!(config.layout.is_system());
    assert_eq!(config.start_interval, keystone_core::DEFAULT_START_INTERVAL);
}

#[test]
fn zero_interval_is_rejected() {
    let err = Cli::try_parse_from(["ksinstall", "--uninstall", "--interval", "0"])
        .expect_err("must reject zero interval");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
}

#[test]
fn unreadable_settings_fail_with_package_and_root() {
    let cli = parse(&[
        "--install",
        "/tmp/Keystone.tbz",
        "--root",
        "/Users/alice",
        "--config",
        "/nonexistent/keystone-settings.toml",
    ]);
    let err = prepare_config(&cli, &SystemIdentity, PathBuf::from("/Users/alice/"))
        .expect_err("missing settings file must fail");
    assert_eq!(err.kind, FailureKind::PathCheck);
    assert!(
        err.to_string()
            .starts_with("/tmp/Keystone.tbz: root=/Users/alice: "),
        "{err}"
    );
}

#[test]
fn setup_failure_without_package_names_the_product() {
    let cli = parse(&["--uninstall"]);
    let err = failure_for(&cli, "com.google.Keystone", "/")(anyhow!("failed to lock /tmp/lock"));
    assert_eq!(
        err.to_string(),
        "com.google.Keystone: root=/: failed to lock /tmp/lock"
    );
}
