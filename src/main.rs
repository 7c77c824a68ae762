use std::process::exit;

use psx_vm::{Bus, Cpu};

fn main() {
    env_logger::init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "psx-vm".into());
    let bios_path = match args.next() {
        Some(path) => path,
        None => {
            println!("usage: {program} <bios>");
            exit(0);
        }
    };

    let mut bus = Bus::new();
    if let Err(err) = bus.load_bios(&bios_path) {
        eprintln!("{bios_path}: {err}");
        exit(1);
    }

    let mut cpu = Cpu::new(bus);
    loop {
        cpu.clock(32);
    }
}
