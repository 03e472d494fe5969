use crate::{
    models::ModelDescriptor,
    protocol::{CommandTable, Validator},
    Model, ResponseCodes, StartupSequence,
};

const VENDOR_ID: u16 = 0x2C99;

/// Responses shared by every Prusa Research printer (Marlin dialect).
fn family_table() -> CommandTable {
    CommandTable::new()
        .with("M105", &[Validator::Ok])
        .with("M155", &[Validator::Ok])
        .with("M104", &[Validator::Ok])
        .with("M140", &[Validator::Ok])
        .with("M109", &[Validator::Ok])
        .with("M190", &[Validator::Ok])
        .with("G92", &[Validator::Ok])
}

/// Original Prusa i3 MK3.
#[derive(Debug, Copy, Clone, Default)]
pub struct PrusaMk3;

impl Model for PrusaMk3 {
    fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            vendor_id: VENDOR_ID,
            product_id: 0x0002,
            description: "Original Prusa MK3 - CDC",
            manufacturer: "Prusa Research",
            model: "MK3",
            max_feed_rate: Some(12000),
            baud: Some(115200),
        }
    }

    fn home_sequence(&self) -> Vec<String> {
        vec!["G28".to_owned(), "G92 E0".to_owned()]
    }

    fn shutdown_sequence(&self) -> Vec<String> {
        [
            "M104 S0",           // extruder off
            "M140 S0",           // bed off
            "M107",              // fan off
            "G1 X0 Y210 F36000", // park X, present the bed
            "M84",               // motors off
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }

    fn cancel_command(&self) -> String {
        "M603".to_owned()
    }

    fn begin_timing_command(&self) -> Option<String> {
        Some("M107".to_owned())
    }
}

impl StartupSequence for PrusaMk3 {
    fn startup_sequence(&self) -> Vec<String> {
        // Temperature auto-reports; the protocol layer skips them.
        vec!["M155 S1".to_owned(), "G90".to_owned(), "M83".to_owned()]
    }
}

impl ResponseCodes for PrusaMk3 {
    fn family_table(&self) -> CommandTable {
        family_table()
    }

    fn model_table(&self) -> CommandTable {
        CommandTable::new()
            .with("M31", &[Validator::Time, Validator::Ok])
            .with("G28", &[Validator::Ok])
            .with("G29.02", &[Validator::Ok, Validator::Ok])
            .with("G29.01", &[Validator::Ok, Validator::Xyz, Validator::Xyz, Validator::Ok])
            .with("M601", &[])
    }
}
