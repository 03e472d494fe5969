use crate::{
    models::ModelDescriptor,
    protocol::{CommandTable, Validator},
    Model, ResponseCodes, StartupSequence,
};

const VENDOR_ID: u16 = 0x23C1;

fn family_table() -> CommandTable {
    CommandTable::new()
        .with("G161", &[Validator::Ok])
        .with("G162", &[Validator::Ok])
        .with("M73", &[Validator::Ok])
        .with("M132", &[Validator::Ok])
        .with("M133", &[Validator::Ok])
}

/// MakerBot Replicator 2.
#[derive(Debug, Copy, Clone, Default)]
pub struct Replicator2;

impl Model for Replicator2 {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            vendor_id: VENDOR_ID,
            product_id: 0xB016,
            description: "Replicator 2 - CDC",
            manufacturer: "MakerBot",
            model: "Replicator 2",
            max_feed_rate: Some(9000),
            baud: Some(115200),
        }
    }

    fn home_sequence(&self) -> Vec<String> {
        vec!["G162 X Y F3000".to_owned(), "G161 Z F1200".to_owned(), "G92 A0".to_owned()]
    }

    fn shutdown_sequence(&self) -> Vec<String> {
        ["M104 S0 T0", "M109 S0 T0", "G162 Z F900", "M18 A B"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn cancel_command(&self) -> String {
        "M112".to_owned()
    }
}

impl StartupSequence for Replicator2 {
    fn startup_sequence(&self) -> Vec<String> {
        [
            "M73 P0",
            "G162 X Y F3000",
            "G161 Z F1200",
            "G92 Z-5",
            "G1 Z0",
            "G161 Z F100",
            "M132 X Y Z A B",
            "G1 X-145 Y-75 Z30 F9000",
            "G130 X20 Y20 Z20 A20 B20",
            "M126 S255",
            "M104 S230 T0",
            "M133 T0",
            "G130 X127 Y127 Z40 A127 B127",
            "G92 A0",
            "G1 Z0.4",
            "G1 E25 F300",
            "G1 X-140 Y-70 Z0.15 F1200",
            "G1 X-135 Y-65 Z0.5 F1200",
            "G92 A0",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }
}

impl ResponseCodes for Replicator2 {
    fn family_table(&self) -> CommandTable {
        family_table()
    }

    fn model_table(&self) -> CommandTable {
        CommandTable::new()
    }
}
