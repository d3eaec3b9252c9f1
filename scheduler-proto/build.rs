use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("scheduler.bin"))
        .include_file("mod.rs")
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile(
            &[
                "proto/scheduler/v1/common.proto",
                "proto/scheduler/v1/executor.proto",
                "proto/scheduler/v1/reporter.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
