use jtag_chains::cable::sim::{SimRegister, SimulatedChain};
use jtag_chains::chaintest::ChainTest;
use jtag_chains::config::{ControlConfig, SystemDescription};
use jtag_chains::control::ChainControl;
use jtag_chains::error::Severity;
use jtag_chains::tester::CableTester;

const SYSTEM: &str = r#"{
    "name": "bench",
    "chips": [
        { "name": "cpu", "ir_length": 8, "access": "RW", "chains": [
            { "name": "ctl", "opcode": "1001", "subchains": [
                { "name": "mode", "length": 4, "access": "RWS", "clears": "low" },
                { "name": "lane", "length": 8,
                  "repeat": { "initial": 0, "final": 3, "increment": 1 } }
            ] },
            { "name": "loop", "opcode": "1010", "length": 156 }
        ] },
        { "name": "io", "ir_length": 4, "chains": [
            { "name": "pads", "opcode": "01", "length": 24, "access": "RW" }
        ] }
    ]
}"#;

fn main() -> jtag_chains::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let desc: SystemDescription = serde_json::from_str(SYSTEM).expect("system description");
    let tree = desc.build()?;
    let mut sim = SimulatedChain::from_tree(&tree)?;
    sim.set_register(0, "1010", SimRegister::InvertingLoopback)?;
    let tester = CableTester::new(sim)?;
    let mut control = ChainControl::new(tree, tester, ControlConfig::default())?;
    control.log.log_other = true;

    control.fill_in_bits("cpu.loop", true)?;
    control.shift("cpu.loop", true, true)?;
    println!("{}", control.out_bits("cpu.loop")?);

    control.set_in_bits_str("cpu.ctl.mode", "1011")?;
    control.shift("cpu.ctl", false, true)?;
    control.shift("cpu.ctl", true, false)?;
    println!("{}", control.out_bits("cpu.ctl.mode")?);

    let mut test = ChainTest::without_supply(&mut control);
    let failed = test.test_all_chains("io", Severity::NonFatal)?;
    println!("io: {} chains failed", failed);
    let failed = test.test_all_chains("cpu", Severity::NoMessage)?;
    println!("cpu: {} chains failed (cpu.loop has no storage)", failed);

    control.disconnect()
}
