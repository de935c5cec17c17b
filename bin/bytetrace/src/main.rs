mod error;
mod probes;

use bytetrace::instrument::{Instrumentor, MethodOutcome, Settings, Verification};
use bytetrace::jvm::class_file::ClassFile;
use bytetrace::jvm::hierarchy::KnownClasses;
use bytetrace::jvm::Name;
use clap::{Arg, ArgAction, Command};
use error::CliError;
use std::fs;
use std::path::PathBuf;

fn main() -> Result<(), CliError> {
    env_logger::init();

    let matches = Command::new("JVM class instrumenter")
        .version(clap::crate_version!())
        .about("Weave tracing probes into a compiled JVM class")
        .arg(
            Arg::new("probes")
                .long("probes")
                .value_name("PROBE_FILE")
                .required(true)
                .help("Probe list, one probe per line"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("CLASS_FILE")
                .help("Where to write the instrumented class (defaults to `<INPUT>.traced`)"),
        )
        .arg(
            Arg::new("classpath")
                .long("class")
                .value_name("CLASS_FILE")
                .action(ArgAction::Append)
                .help("Other class file whose super types matching and verification may need"),
        )
        .arg(
            Arg::new("no-verify")
                .long("no-verify")
                .action(ArgAction::SetTrue)
                .help("Skip re-checking the whole class after rewriting it"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Class file to instrument")
                .required(true)
                .index(1),
        )
        .get_matches();

    let probe_file = matches
        .get_one::<String>("probes")
        .expect("`--probes` is required");
    log::info!("Reading probes from '{}'", probe_file);
    let probes = probes::parse_probes(&fs::read_to_string(probe_file)?)?;

    // Everything the tool knows of the class hierarchy comes from the files it is given
    let mut hierarchy = KnownClasses::with_java_lang();
    for class_path in matches.get_many::<String>("classpath").into_iter().flatten() {
        let class = ClassFile::from_bytes(&fs::read(class_path)?)?;
        let name = hierarchy.insert_class_file(&class)?;
        log::debug!("Added '{}' to the hierarchy", name.as_str());
    }

    let input = matches
        .get_one::<String>("INPUT")
        .expect("`INPUT` is required");
    log::info!("Reading and instrumenting '{}'", input);
    let bytes = fs::read(input)?;
    hierarchy.insert_class_file(&ClassFile::from_bytes(&bytes)?)?;

    let settings = Settings {
        verify: !matches.get_flag("no-verify"),
        ..Settings::default()
    };
    let instrumentor = Instrumentor::new(settings)?;
    let outcome = instrumentor.transform(&bytes, &hierarchy, &probes)?;

    let output = match matches.get_one::<String>("output") {
        Some(output) => PathBuf::from(output),
        None => PathBuf::from(format!("{}.traced", input)),
    };
    log::info!("Writing '{}'", output.display());
    fs::write(&output, &outcome.bytes)?;

    // Summary
    let diagnostics = &outcome.diagnostics;
    if let Some(skip) = diagnostics.skipped {
        println!("class left alone: {:?}", skip);
    }
    for method in &diagnostics.methods {
        match &method.outcome {
            MethodOutcome::Instrumented => println!("{}: instrumented", method.method),
            MethodOutcome::Unchanged => println!("{}: unchanged", method.method),
            MethodOutcome::KeptOriginal(err) => println!("{}: kept original ({:?})", method.method, err),
        }
        for site in &method.sites {
            let node = site.node.map_or(String::from("method"), |node| format!("node {}", node));
            match &site.skipped {
                None => println!("  {:?} {:?} at {} -> {}", site.kind, site.point, node, site.handler),
                Some(reason) => println!("  {:?} {:?} at {} skipped: {:?}", site.kind, site.point, node, reason),
            }
        }
    }
    for sampler in &diagnostics.samplers {
        println!(
            "sampler {}: mean {}{}",
            sampler.id,
            sampler.mean,
            if sampler.adaptive { " (adaptive)" } else { "" }
        );
    }
    for trace in &diagnostics.registrations {
        println!("registered for retransform by {}", trace.as_str());
    }
    match &diagnostics.verification {
        Verification::NotNeeded => (),
        Verification::Passed => println!("verified"),
        Verification::Unchecked => println!("not verified"),
        Verification::Reverted(reason) => println!("reverted: {}", reason),
    }

    Ok(())
}
