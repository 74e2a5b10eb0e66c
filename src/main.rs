use std::sync::Arc;

use crate::deps::{
    log::{
        debug,
        info,
    },
    structopt::StructOpt,
    tierswap::{
        balancing::{
            add_page_for_exchange,
            add_page_for_tracking,
            mod_page_access_level,
            set_page_last_cpu,
        },
        config::MigrateMode,
        exchange::{
            exchange_two_pages,
            try_exchange_page,
        },
        frames::PAGE_SIZE,
        node::{
            Machine,
            MachineSpec,
        },
        page::PhysicalPage,
        rmap::Vma,
    },
};

pub mod deps {
    pub(crate) use env_logger;
    pub(crate) use log;
    pub(crate) use serde_json;
    pub(crate) use structopt;

    pub(crate) use tierswap;
}


mod cli {
    pub fn println<T>(
        value: &T,
        verbose: bool,
    ) where
        T: std::fmt::Debug,
    {
        if verbose {
            println!("{:#?}", value);
        } else {
            println!("{:?}", value);
        }
    }
}

macro_rules! panic_on_err {
    () => {
        |err| panic!("[ERROR] {}:{}: {}", err, module_path!(), line!())
    };
}


#[derive(Debug, StructOpt)]
#[structopt(name = "tierswap", about = "tiered-memory page exchange")]
struct Args {
    #[structopt(short, long)]
    debug: bool,

    #[structopt(short, long)]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Command,
}


#[derive(Clone, Debug, StructOpt, PartialEq)]
enum Command {
    Pair(Pair),
    Demo(Demo),
    Stats(Stats),
}


/// Exchange two synthetic anonymous pages and show both sides of the swap.
#[derive(Clone, Debug, StructOpt, PartialEq)]
struct Pair {
    #[structopt(long, default_value = "32")]
    frames: usize,

    #[structopt(long)]
    concur: bool,
}


/// Run sampling, election and promotion-fallback exchange on a two-tier
/// machine.
#[derive(Clone, Debug, StructOpt, PartialEq)]
struct Demo {
    #[structopt(long, default_value = "8")]
    pages: usize,

    #[structopt(long, default_value = "4")]
    rounds: usize,

    #[structopt(long, default_value = "4")]
    cpus: usize,

    #[structopt(long, default_value = "64")]
    frames: usize,
}


#[derive(Clone, Debug, StructOpt, PartialEq)]
struct Stats {}


fn mapped_anon_page(
    machine: &Arc<Machine>,
    nid: usize,
    vaddr: u64,
) -> (Arc<PhysicalPage>, Arc<Vma>) {
    let anon_vma = machine.new_anon_vma();
    let vma = Vma::new_anon(vaddr, 1, &anon_vma);
    let page = machine.alloc_page(nid, 0).unwrap_or_else(panic_on_err!());
    machine
        .map_anon_page(&page, &vma, vaddr / PAGE_SIZE as u64)
        .unwrap_or_else(panic_on_err!());
    machine.add_to_lru(&page);
    (page, vma)
}


fn pair_command(
    args: &Args,
    cmd: &Pair,
) {
    let machine = Machine::new(MachineSpec::two_tier(1, 1, 2, cmd.frames))
        .unwrap_or_else(panic_on_err!());

    let (from, from_vma) = mapped_anon_page(&machine, 1, 0x400000);
    let (to, to_vma) = mapped_anon_page(&machine, 0, 0x500000);
    from.fill(0xAA);
    to.fill(0xBB);

    println!(
        "before: 0x400000 -> {:?} [{:#04x}..], 0x500000 -> {:?} [{:#04x}..]",
        from_vma.resolve(0x400000).unwrap(),
        machine.read_virtual(&from_vma, 0x400000, 8).unwrap()[0],
        to_vma.resolve(0x500000).unwrap(),
        machine.read_virtual(&to_vma, 0x500000, 8).unwrap()[0],
    );

    // The faulting side holds an extra reference on the page it brings in.
    from.get_page();

    let mode = if cmd.concur {
        MigrateMode::SYNC | MigrateMode::CONCUR | MigrateMode::MT
    } else {
        MigrateMode::SYNC
    };

    exchange_two_pages(&machine, &from, &to, mode).unwrap_or_else(panic_on_err!());

    println!(
        "after:  0x400000 -> {:?} [{:#04x}..], 0x500000 -> {:?} [{:#04x}..]",
        from_vma.resolve(0x400000).unwrap(),
        machine.read_virtual(&from_vma, 0x400000, 8).unwrap()[0],
        to_vma.resolve(0x500000).unwrap(),
        machine.read_virtual(&to_vma, 0x500000, 8).unwrap()[0],
    );

    if args.verbose {
        cli::println(&*from, true);
        cli::println(&*to, true);
    }

    println!(
        "{}",
        crate::deps::serde_json::to_string_pretty(&machine.events().snapshot()).unwrap()
    );
}


fn demo_command(
    args: &Args,
    cmd: &Demo,
) {
    let machine = Machine::new(MachineSpec::two_tier(1, 1, cmd.cpus, cmd.frames))
        .unwrap_or_else(panic_on_err!());
    machine.config().set_skip_lower_tier(0).unwrap_or_else(panic_on_err!());

    let bottom_cpu = machine.node(1).cpus()[0] as i32;

    // Cold pages resident on the full top node become exchange victims.
    let mut victims = Vec::new();
    for i in 0..cmd.pages {
        let (page, vma) = mapped_anon_page(&machine, 0, 0x10_0000_0000 + ((i as u64) << 16));
        page.fill(0xC0);
        set_page_last_cpu(&machine, &page, bottom_cpu);
        for _ in 0..cmd.rounds {
            let prev = mod_page_access_level(&machine, &page, false);
            add_page_for_tracking(&machine, &page, prev);
        }
        add_page_for_exchange(&machine, &page, 0);
        victims.push((page, vma));
    }

    // Hot pages on the bottom node want promotion.
    let mut hot = Vec::new();
    for i in 0..cmd.pages {
        let (page, vma) = mapped_anon_page(&machine, 1, 0x20_0000_0000 + ((i as u64) << 16));
        page.fill(0x42);
        for _ in 0..cmd.rounds {
            let prev = mod_page_access_level(&machine, &page, true);
            add_page_for_tracking(&machine, &page, prev);
        }
        hot.push((page, vma));
    }

    info!(
        "demo: {} hot pages below, {} victims deferred above",
        hot.len(),
        victims.len()
    );

    let mut promoted = 0;
    for (page, _vma) in hot.iter() {
        page.get_page();
        if try_exchange_page(&machine, page, 0) {
            promoted += 1;
        } else if page.page_count() == 2 {
            machine.put_page(page);
        }
        debug!("hot page {:?}: count {}", page.pfn(), page.page_count());
    }

    println!("promoted {} of {} hot pages by exchange", promoted, hot.len());
    println!(
        "{}",
        crate::deps::serde_json::to_string_pretty(&machine.events().snapshot()).unwrap()
    );
    println!(
        "{}",
        crate::deps::serde_json::to_string_pretty(&machine.report()).unwrap()
    );

    if args.verbose {
        for (page, vma) in hot.iter() {
            let addr = vma.start();
            let byte = machine.read_virtual(vma, addr, 1).unwrap()[0];
            println!("{:#x}: first byte {:#04x} now at {:?}", addr, byte, vma.resolve(addr).unwrap());
        }
    }
}


fn stats_command(
    args: &Args,
    _cmd: &Stats,
) {
    let machine = Machine::new(MachineSpec::two_tier(1, 1, 2, 16))
        .unwrap_or_else(panic_on_err!());

    println!(
        "{}",
        crate::deps::serde_json::to_string_pretty(&machine.config().snapshot()).unwrap()
    );
    println!(
        "{}",
        crate::deps::serde_json::to_string_pretty(&machine.report()).unwrap()
    );

    if args.verbose {
        cli::println(&machine.config().snapshot(), true);
    }
}


fn main() {
    let args = Args::from_args();
    if args.debug {
        crate::deps::env_logger::builder()
            .filter_level(crate::deps::log::LevelFilter::Debug)
            .init();
    } else {
        crate::deps::env_logger::builder()
            .filter_level(crate::deps::log::LevelFilter::Warn)
            .init();
    }

    debug!("program arguments: {:#?}", args);

    match &args.cmd {
        Command::Pair(cmd) => pair_command(&args, cmd),
        Command::Demo(cmd) => demo_command(&args, cmd),
        Command::Stats(cmd) => stats_command(&args, cmd),
    }
}
