use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use charmforge::charm::catalog;
use charmforge::source::RemoteSource;
use charmforge::{
    ConfigOption, EventKind, ForgeConfig, Framework, JobRequest, OptionSet, OptionType, Orchestrator,
    Outcome, SourceSpec,
};

fn usage() -> &'static str {
    "Usage:\n  charmforge generate <framework> --repo <url> [--branch <name>] [--subfolder <path>] [options]\n  charmforge generate <framework> --archive <file> [options]\n  charmforge catalog\n\nOptions:\n  --integration <id>            may be repeated; see `charmforge catalog`\n  --option <key>:<type>[=<default>]  may be repeated; <type> is string|int|bool|float|secret;\n                                a default marks the option as optional\n  --config <file>               load tool paths and timeouts from a TOML file\n  --output <file>               where to write the bundle (default ./<job>-bundle.zip)"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("generate") => generate(&args[1..]),
        Some("catalog") => {
            print_catalog();
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn print_catalog() {
    println!("{:<12} {:<18} {:<20} {:<8} {}", "ID", "RELATION", "INTERFACE", "SIDE", "NOTES");
    for entry in catalog::CATALOG {
        let side = match entry.direction {
            catalog::Direction::Provide => "provide",
            catalog::Direction::Require => "require",
        };
        let mut notes = Vec::new();
        if entry.optional {
            notes.push("optional".to_string());
        }
        if let Some(limit) = entry.limit {
            notes.push(format!("limit {limit}"));
        }
        println!(
            "{:<12} {:<18} {:<20} {:<8} {}",
            entry.id,
            entry.relation,
            entry.interface,
            side,
            notes.join(", ")
        );
    }
}

struct GenerateArgs {
    framework: Framework,
    repo: Option<String>,
    branch: String,
    subfolder: Option<String>,
    archive: Option<PathBuf>,
    integrations: Vec<String>,
    options: OptionSet,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
}

fn parse_generate(args: &[String]) -> Result<GenerateArgs> {
    let Some(framework_tag) = args.first() else {
        bail!(usage());
    };

    let mut parsed = GenerateArgs {
        framework: Framework::parse(framework_tag),
        repo: None,
        branch: "main".to_string(),
        subfolder: None,
        archive: None,
        integrations: Vec::new(),
        options: OptionSet::new(),
        config: None,
        output: None,
    };

    let mut rest = args[1..].iter();
    while let Some(flag) = rest.next() {
        let mut value = |name: &str| -> Result<String> {
            rest.next()
                .cloned()
                .with_context(|| format!("missing value for {name}"))
        };
        match flag.as_str() {
            "--repo" => parsed.repo = Some(value("--repo")?),
            "--branch" => parsed.branch = value("--branch")?,
            "--subfolder" => parsed.subfolder = Some(value("--subfolder")?),
            "--archive" => parsed.archive = Some(PathBuf::from(value("--archive")?)),
            "--integration" => parsed.integrations.push(value("--integration")?),
            "--option" => {
                let raw = value("--option")?;
                parsed.options.add(parse_option(&raw)?)?;
            }
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--output" => parsed.output = Some(PathBuf::from(value("--output")?)),
            other => bail!("unknown flag '{other}'\n\n{}", usage()),
        }
    }

    if parsed.repo.is_some() == parsed.archive.is_some() {
        bail!("exactly one of --repo or --archive is required\n\n{}", usage());
    }
    Ok(parsed)
}

/// `<key>:<type>` declares a required option; `<key>:<type>=<default>`
/// declares an optional one with a typed default.
fn parse_option(raw: &str) -> Result<ConfigOption> {
    let (head, default) = match raw.split_once('=') {
        Some((head, default)) => (head, Some(default.to_string())),
        None => (raw, None),
    };
    let (key, type_tag) = head
        .split_once(':')
        .with_context(|| format!("option '{raw}' must look like key:type[=default]"))?;
    let value_type = OptionType::parse(type_tag)
        .with_context(|| format!("unknown option type '{type_tag}'"))?;
    let optional = default.is_some();
    Ok(ConfigOption::new(key, value_type, optional, default)?)
}

fn generate(args: &[String]) -> Result<()> {
    let parsed = parse_generate(args)?;

    let config = match &parsed.config {
        Some(path) => ForgeConfig::load(path)?,
        None => ForgeConfig::default(),
    };
    let orchestrator = Orchestrator::new(config);

    let source = if let Some(repo) = parsed.repo.clone() {
        SourceSpec::Remote(RemoteSource {
            url: repo,
            branch: parsed.branch.clone(),
            subfolder: parsed.subfolder.clone(),
        })
    } else {
        let path = parsed.archive.clone().expect("validated above");
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("archive path '{}' has no file name", path.display()))?
            .to_string();
        let file = File::open(&path)
            .with_context(|| format!("opening archive '{}'", path.display()))?;
        SourceSpec::Archive {
            data: Box::new(file),
            filename,
        }
    };

    let job = orchestrator.submit(JobRequest {
        source,
        framework: parsed.framework,
        integrations: parsed.integrations.clone(),
        options: parsed.options.clone(),
    })?;
    println!("[job {job}] pipeline started");

    let outcome = stream_events(&orchestrator, job)?;
    match outcome {
        Outcome::Success { .. } => {
            let bytes = orchestrator.retrieve(job)?;
            let output = parsed
                .output
                .unwrap_or_else(|| PathBuf::from(format!("{job}-bundle.zip")));
            std::fs::write(&output, bytes)
                .with_context(|| format!("writing bundle '{}'", output.display()))?;
            println!("[job {job}] bundle written to {}", output.display());
            Ok(())
        }
        Outcome::Failure { message } => bail!("pipeline failed: {message}"),
    }
}

fn stream_events(orchestrator: &Orchestrator, job: charmforge::JobId) -> Result<Outcome> {
    let mut cursor = 0;
    loop {
        let (events, outcome) = orchestrator.events(job, cursor)?;
        cursor += events.len();
        for event in &events {
            print_event(event);
        }
        if let Some(outcome) = outcome {
            return Ok(outcome);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn print_event(event: &charmforge::StatusEvent) {
    let stamp = OffsetDateTime::from_unix_timestamp(event.at_unix as i64)
        .ok()
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_default();
    match event.kind {
        EventKind::Status => println!("[{stamp}] {}", event.text),
        EventKind::Log => println!("    {}", event.text),
    }
}
