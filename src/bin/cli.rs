use clap::{App, Arg, ArgMatches, SubCommand};
use shmsync::{
    Acquisition, ObjectTable, Ptid, RegionConfig, Result, SharedMemoryRegion, ShmSyncError,
    SlotId, TableConfig,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

fn file_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("file")
        .short("f")
        .long("file")
        .value_name("FILE")
        .help("Path of the object table file")
        .required(true)
        .takes_value(true)
}

fn slot_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("slot")
        .short("s")
        .long("slot")
        .value_name("SLOT")
        .help("Slot index of the object")
        .required(true)
        .takes_value(true)
}

fn ptid_arg<'a, 'b>(required: bool) -> Arg<'a, 'b> {
    Arg::with_name("ptid")
        .short("p")
        .long("ptid")
        .value_name("PTID")
        .help("Thread identifier acting on the object")
        .required(required)
        .takes_value(true)
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("shmsync-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and drive shared synchronization objects")
        .subcommand(
            SubCommand::with_name("init")
                .about("Create an empty object table")
                .arg(file_arg())
                .arg(
                    Arg::with_name("capacity")
                        .short("c")
                        .long("capacity")
                        .value_name("SLOTS")
                        .help("Number of object slots")
                        .default_value("4096")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("dump")
                .about("List every allocated object and its state")
                .arg(file_arg()),
        )
        .subcommand(
            SubCommand::with_name("create")
                .about("Create an object in a free slot")
                .arg(file_arg())
                .arg(
                    Arg::with_name("kind")
                        .short("k")
                        .long("kind")
                        .value_name("KIND")
                        .help("Object type")
                        .possible_values(&["mutex", "event", "semaphore"])
                        .required(true)
                        .takes_value(true),
                )
                .arg(ptid_arg(false).help("Initial mutex owner"))
                .arg(
                    Arg::with_name("manual")
                        .long("manual")
                        .help("Manual-reset event"),
                )
                .arg(
                    Arg::with_name("signaled")
                        .long("signaled")
                        .help("Event starts signaled"),
                )
                .arg(
                    Arg::with_name("initial")
                        .long("initial")
                        .value_name("COUNT")
                        .help("Initial semaphore count")
                        .default_value("0")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("maximum")
                        .long("maximum")
                        .value_name("COUNT")
                        .help("Maximum semaphore count")
                        .default_value("1")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("acquire")
                .about("Non-blocking wait on any object")
                .arg(file_arg())
                .arg(slot_arg())
                .arg(ptid_arg(true)),
        )
        .subcommand(
            SubCommand::with_name("signal")
                .about("Signal an event")
                .arg(file_arg())
                .arg(slot_arg()),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Reset an event")
                .arg(file_arg())
                .arg(slot_arg()),
        )
        .subcommand(
            SubCommand::with_name("release")
                .about("Release a mutex (with --ptid) or semaphore units (with --count)")
                .arg(file_arg())
                .arg(slot_arg())
                .arg(ptid_arg(false))
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("UNITS")
                        .help("Semaphore units to release")
                        .default_value("1")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("abandon")
                .about("Mark every mutex held by a dead thread abandoned")
                .arg(file_arg())
                .arg(ptid_arg(true)),
        )
        .subcommand(
            SubCommand::with_name("free")
                .about("Return a slot to the table")
                .arg(file_arg())
                .arg(slot_arg()),
        )
        .subcommand(SubCommand::with_name("info").about("Show version and layout information"))
        .get_matches();

    match matches.subcommand() {
        ("init", Some(m)) => handle_init(m),
        ("dump", Some(m)) => handle_dump(m),
        ("create", Some(m)) => handle_create(m),
        ("acquire", Some(m)) => handle_acquire(m),
        ("signal", Some(m)) => handle_event(m, true),
        ("reset", Some(m)) => handle_event(m, false),
        ("release", Some(m)) => handle_release(m),
        ("abandon", Some(m)) => handle_abandon(m),
        ("free", Some(m)) => handle_free(m),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    let raw = matches
        .value_of(name)
        .ok_or_else(|| ShmSyncError::invalid_parameter(name, "Missing value"))?;
    raw.parse()
        .map_err(|_| ShmSyncError::invalid_parameter(name, format!("Invalid value '{}'", raw)))
}

fn parse_ptid(matches: &ArgMatches) -> Result<Option<Ptid>> {
    if !matches.is_present("ptid") {
        return Ok(None);
    }
    let raw = matches.value_of("ptid").unwrap_or_default();
    let value = match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    }
    .map_err(|_| ShmSyncError::invalid_parameter("ptid", format!("Invalid ptid '{}'", raw)))?;
    Ok(Some(Ptid::new(value)))
}

fn table_path(matches: &ArgMatches) -> Result<PathBuf> {
    matches
        .value_of("file")
        .map(PathBuf::from)
        .ok_or_else(|| ShmSyncError::invalid_parameter("file", "Missing table file"))
}

fn region_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "objects".to_string())
}

fn open_table(matches: &ArgMatches) -> Result<ObjectTable> {
    let path = table_path(matches)?;
    let region = SharedMemoryRegion::new(RegionConfig::open(region_name(&path), &path))?;
    ObjectTable::attach(Arc::new(region), TableConfig::default())
}

fn handle_init(matches: &ArgMatches) -> Result<()> {
    let path = table_path(matches)?;
    let config = TableConfig::new(parse_arg(matches, "capacity")?);
    let region = SharedMemoryRegion::new(
        RegionConfig::new(region_name(&path), config.region_size()).with_file_path(&path),
    )?;
    let table = ObjectTable::create(Arc::new(region), config)?;
    println!(
        "Created object table '{}' with {} slots ({} bytes)",
        path.display(),
        table.capacity(),
        table.region().size()
    );
    Ok(())
}

fn handle_dump(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let stats = table.stats();
    println!(
        "{} of {} slots allocated ({:.1}%): {} mutexes, {} events, {} semaphores, {} uninitialized",
        stats.allocated,
        stats.capacity,
        stats.utilization() * 100.0,
        stats.mutexes,
        stats.events,
        stats.semaphores,
        stats.uninitialized
    );
    for (slot, state) in table.dump()? {
        let guard = table.get(slot)?.guard().raw();
        println!("  {:>6}  guard={:#010x}  {}", slot.to_string(), guard, state);
    }
    Ok(())
}

fn handle_create(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let slot = match matches.value_of("kind") {
        Some("mutex") => table.create_mutex(parse_ptid(matches)?)?,
        Some("event") => {
            table.create_event(matches.is_present("manual"), matches.is_present("signaled"))?
        }
        Some("semaphore") => table.create_semaphore(
            parse_arg(matches, "initial")?,
            parse_arg(matches, "maximum")?,
        )?,
        other => {
            return Err(ShmSyncError::invalid_parameter(
                "kind",
                format!("Unsupported kind {:?}", other),
            ))
        }
    };
    println!("Created {} in slot {}", table.snapshot(slot)?, slot);
    Ok(())
}

fn handle_acquire(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let slot = SlotId(parse_arg(matches, "slot")?);
    let requester = parse_ptid(matches)?.unwrap_or_else(Ptid::current);
    match table.try_wait(slot, requester)? {
        Acquisition::Acquired => println!("Acquired {}", slot),
        Acquisition::Recursive(depth) => println!("Re-acquired {} (depth {})", slot, depth),
        Acquisition::Abandoned => println!("Acquired {} (previous owner abandoned it)", slot),
        Acquisition::NotAvailable => println!("{} is not available", slot),
    }
    Ok(())
}

fn handle_event(matches: &ArgMatches, signal: bool) -> Result<()> {
    let table = open_table(matches)?;
    let slot = SlotId(parse_arg(matches, "slot")?);
    let event = table.event(slot)?;
    let previous = if signal { event.signal()? } else { event.reset()? };
    println!(
        "{} event {} (was {})",
        if signal { "Signaled" } else { "Reset" },
        slot,
        if previous { "signaled" } else { "not signaled" }
    );
    Ok(())
}

fn handle_release(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let slot = SlotId(parse_arg(matches, "slot")?);
    match parse_ptid(matches)? {
        Some(requester) => {
            let previous = table.mutex(slot)?.release(requester)?;
            println!("Released mutex {} (depth was {})", slot, previous);
        }
        None => {
            let previous = table.semaphore(slot)?.release(parse_arg(matches, "count")?)?;
            println!("Released semaphore {} (count was {})", slot, previous);
        }
    }
    Ok(())
}

fn handle_abandon(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let owner = parse_ptid(matches)?
        .ok_or_else(|| ShmSyncError::invalid_parameter("ptid", "Missing ptid"))?;
    let count = table.abandon_mutexes(owner)?;
    println!("Marked {} mutexes held by {} abandoned", count, owner);
    Ok(())
}

fn handle_free(matches: &ArgMatches) -> Result<()> {
    let table = open_table(matches)?;
    let slot = SlotId(parse_arg(matches, "slot")?);
    table.free(slot)?;
    println!("Freed slot {}", slot);
    Ok(())
}

fn show_info() -> Result<()> {
    println!("shmsync {}", shmsync::VERSION);
    println!("  record size:    {} bytes", shmsync::SyncObject::SIZE);
    println!("  table magic:    {:#018x}", shmsync::table::TABLE_MAGIC);
    println!("  table version:  {}", shmsync::table::TABLE_VERSION);
    println!("  default slots:  {}", shmsync::config::DEFAULT_TABLE_CAPACITY);
    println!("  guard timeout:  {:?}", shmsync::config::DEFAULT_GUARD_TIMEOUT);
    Ok(())
}
