use std::{
    io::{self, IsTerminal, Read},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use arcanum::{
    Error, Result,
    adapters::list_adapters,
    cli::{BindingCommand, Cli, Command, ConfigCommand, OutputArgs, ShortcutsArgs, StartArgs},
    configuration::Settings,
    progress_log::ProgressLog,
    provisioner::Provisioner,
    proxy::{non_blank_lines, parse_proxies},
    sandbox_ini::BindingResolver,
    shortcuts::{self, group_box_name},
    system::{self, SilentRunner},
};
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.global.verbose {
        0 => "arcanum=info",
        1 => "arcanum=debug",
        _ => "arcanum=trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    log::info!(
        "arcanum v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("<default: {default_filter}>")),
    );

    let settings_path = cli
        .global
        .config
        .clone()
        .unwrap_or_else(Settings::settings_file_path);

    match run(cli.command, &settings_path) {
        Ok(code) => code,
        Err(error) => {
            log::debug!("[main] command failed: {error:?}");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, settings_path: &Path) -> Result<ExitCode> {
    let mut settings = Settings::load(settings_path);

    match command {
        Command::Start(args) => start(args, &mut settings, settings_path),
        Command::Stop => {
            let provisioner = provisioner_for(&settings);
            provisioner.stop_all();
            println!("Stopped existing tun2socks processes.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Adapters(output) => adapters(output),
        Command::Shortcuts(args) => shortcut_groups(args, &mut settings, settings_path),
        Command::Binding(command) => binding(command, &settings),
        Command::Launch { path } => {
            shortcuts::launch_shortcut(&path)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(command) => config(command, &mut settings, settings_path),
    }
}

fn provisioner_for(settings: &Settings) -> Provisioner {
    Provisioner::new(
        system::host_network(),
        settings.paths.tun2socks.clone(),
        settings.provisioning,
    )
}

fn resolver_for(settings: &Settings) -> BindingResolver {
    BindingResolver::new(
        &settings.paths.sandboxie_ini,
        &settings.paths.sbie_ini_exe,
        Arc::new(SilentRunner),
    )
}

fn read_proxy_text(args: &StartArgs, settings: &Settings) -> Result<String> {
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path).map_err(|source| Error::ProxyListRead {
            path: path.clone(),
            source,
        });
    }

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        let mut text = String::new();
        stdin.lock().read_to_string(&mut text)?;
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    log::info!(
        "[start] using {} saved proxy lines",
        settings.proxies_list.len()
    );
    Ok(settings.proxies_list.join("\n"))
}

fn preflight(settings: &Settings) {
    if system::is_running_as_admin() {
        log::info!("[preflight] running with administrator rights");
    } else {
        log::warn!("[preflight] not running as administrator; address changes will likely fail");
    }
    system::check_tun_device(&settings.paths.wintun_candidates());
}

fn start(args: StartArgs, settings: &mut Settings, settings_path: &Path) -> Result<ExitCode> {
    let text = read_proxy_text(&args, settings)?;
    let parsed = parse_proxies(&text);
    if parsed.is_empty() {
        return Err(Error::NoValidProxies);
    }

    settings.proxies_list = non_blank_lines(&text);
    if let Err(error) = settings.save(settings_path) {
        log::warn!("[settings] {error}");
    }

    preflight(settings);

    #[cfg(target_os = "windows")]
    let _batch_lock = arcanum::single_instance::BatchLock::acquire()?;

    let provisioner = provisioner_for(settings);
    let progress = Arc::new(Mutex::new(ProgressLog::new()));
    let sink = ProgressLog::sink(progress.clone(), |line| println!("{}", line.render()));

    let report = provisioner
        .start(parsed.records, sink)?
        .join()
        .map_err(|_| io::Error::other("provisioning thread panicked"))?;

    if let Ok(progress) = progress.lock() {
        log::info!("[start] {}", progress.summary());
    }
    println!(
        "{} ready, {} failed",
        report.ready_count(),
        report.failed_count()
    );

    Ok(if report.failed_count() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn adapters(output: OutputArgs) -> Result<ExitCode> {
    let adapters = list_adapters(system::host_network().as_ref());
    if output.json {
        println!("{}", serde_json::to_string_pretty(&adapters)?);
    } else {
        for adapter in adapters {
            println!("{adapter}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn shortcut_groups(
    args: ShortcutsArgs,
    settings: &mut Settings,
    settings_path: &Path,
) -> Result<ExitCode> {
    let directory = match args.directory {
        Some(directory) => {
            settings.last_shortcuts_dir = directory.display().to_string();
            if let Err(error) = settings.save(settings_path) {
                log::warn!("[settings] {error}");
            }
            directory
        }
        None if !settings.last_shortcuts_dir.is_empty() => {
            PathBuf::from(&settings.last_shortcuts_dir)
        }
        None => {
            eprintln!("No shortcuts directory given and none saved.");
            return Ok(ExitCode::FAILURE);
        }
    };

    let scan = shortcuts::scan(&directory);
    let resolver = resolver_for(settings);

    if args.output.json {
        let groups: Vec<serde_json::Value> = scan
            .groups
            .iter()
            .map(|(group_id, entries)| {
                let box_name = group_box_name(entries).unwrap_or_default();
                serde_json::json!({
                    "group_id": group_id,
                    "box_name": box_name,
                    "binding": resolver.get_binding(box_name).to_string(),
                    "shortcuts": entries,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(ExitCode::SUCCESS);
    }

    if scan.groups.is_empty() {
        println!("No shortcuts found in {}", directory.display());
    }
    for (group_id, entries) in &scan.groups {
        let box_name = group_box_name(entries).unwrap_or_default();
        let labels: Vec<String> = entries.iter().map(|entry| entry.label()).collect();
        println!(
            "#{group_id} [{box_name}] -> {}: {}",
            resolver.get_binding(box_name),
            labels.join(", ")
        );
        for entry in entries {
            println!("    {}", entry.file_path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn binding(command: BindingCommand, settings: &Settings) -> Result<ExitCode> {
    let resolver = resolver_for(settings);
    match command {
        BindingCommand::Get { box_name } => {
            println!("{}", resolver.get_binding(&box_name));
            Ok(ExitCode::SUCCESS)
        }
        BindingCommand::Set { box_name, adapter } => {
            if resolver.set_binding(&box_name, &adapter) {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("Failed to set {box_name} BindAdapter to {adapter}");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn config(command: ConfigCommand, settings: &mut Settings, settings_path: &Path) -> Result<ExitCode> {
    match command {
        ConfigCommand::Show => print!("{}", toml::to_string_pretty(&*settings)?),
        ConfigCommand::SetPath { name, value } => {
            settings.set_path(&name, &value)?;
            settings.save(settings_path)?;
            println!("{name} = {}", settings.get_path(&name)?);
        }
        ConfigCommand::Path => println!("{}", settings_path.display()),
    }
    Ok(ExitCode::SUCCESS)
}
