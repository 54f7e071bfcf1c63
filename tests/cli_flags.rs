//! Tests for the command-line surface: argument parsing and completions.

use clap::{CommandFactory, Parser};
use ecotest::cli::{Cli, Commands};
use ecotest::dataset::Mode;
use ecotest::report::ReportFormat;
use std::path::PathBuf;

// ── Shell completions ────────────────────────────────────────────────

#[test]
fn completions_bash_generates_output() {
    let mut buf = Vec::new();
    clap_complete::generate(
        clap_complete::Shell::Bash,
        &mut Cli::command(),
        "ecotest",
        &mut buf,
    );
    let output = String::from_utf8(buf).unwrap();
    assert!(!output.is_empty(), "bash completions should produce output");
    assert!(output.contains("ecotest"));
}

#[test]
fn completions_subcommand_parses() {
    let cli = Cli::parse_from(["ecotest", "completions", "zsh"]);
    assert!(matches!(
        cli.command,
        Commands::Completions {
            shell: clap_complete::Shell::Zsh
        }
    ));
}

// ── run ──────────────────────────────────────────────────────────────

#[test]
fn run_takes_two_binaries_and_repeated_modes() {
    let cli = Cli::parse_from([
        "ecotest",
        "run",
        "./uv-main",
        "./uv-branch",
        "--mode",
        "compile",
        "--mode",
        "pyproject-toml",
        "--limit",
        "10",
        "--report",
        "report.md",
        "--timeout",
        "120",
        "--isolated",
    ]);
    let Commands::Run(args) = cli.command else {
        panic!("expected run");
    };
    assert_eq!(args.base_bin, PathBuf::from("./uv-main"));
    assert_eq!(args.branch_bin, PathBuf::from("./uv-branch"));
    assert_eq!(args.mode, vec![Mode::Compile, Mode::PyprojectToml]);
    assert_eq!(args.resolver.limit, Some(10));
    assert_eq!(args.resolver.timeout, Some(120));
    assert!(args.resolver.isolated);
    assert_eq!(args.report, Some(PathBuf::from("report.md")));
    assert_eq!(args.format, ReportFormat::Markdown);
}

#[test]
fn run_requires_both_binaries() {
    assert!(Cli::try_parse_from(["ecotest", "run", "./uv"]).is_err());
}

#[test]
fn unknown_mode_is_rejected() {
    assert!(Cli::try_parse_from(["ecotest", "run", "a", "b", "--mode", "install"]).is_err());
}

#[test]
fn run_with_allow_build_needs_confirmation() {
    let cli = Cli::parse_from(["ecotest", "run", "a", "b", "--allow-build"]);
    let Commands::Run(args) = cli.command else {
        panic!("expected run");
    };
    let err = ecotest::cli::run(args, &ecotest::runner::CancelFlag::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ecotest::error::HarnessError>(),
        Some(ecotest::error::HarnessError::Config(_))
    ));
}

// ── resolve / report ─────────────────────────────────────────────────

#[test]
fn resolve_parses_single_binary_flags() {
    let cli = Cli::parse_from([
        "ecotest", "resolve", "--mode", "lock", "--bin", "uv", "--output", "out", "--latest",
        "--stats",
    ]);
    let Commands::Resolve(args) = cli.command else {
        panic!("expected resolve");
    };
    assert_eq!(args.mode, Mode::Lock);
    assert_eq!(args.binary, PathBuf::from("uv"));
    assert!(args.resolver.latest);
    assert!(args.resolver.stats);
}

#[test]
fn report_defaults_to_markdown() {
    let cli = Cli::parse_from(["ecotest", "report", "base", "branch", "--mode", "sync"]);
    match cli.command {
        Commands::Report {
            mode,
            format,
            output,
            ..
        } => {
            assert_eq!(mode, Mode::Sync);
            assert_eq!(format, ReportFormat::Markdown);
            assert!(output.is_none());
        }
        _ => panic!("expected report"),
    }
}

#[test]
fn verbose_is_global() {
    let cli = Cli::parse_from(["ecotest", "fetch", "-v"]);
    assert!(cli.verbose);
}
