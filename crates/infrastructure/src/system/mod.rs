mod machine_id;

pub use machine_id::EtcMachineId;
