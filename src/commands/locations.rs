use ntfs_artifact_forge::models::{LocationRow, PartitionRow};
use ntfs_artifact_forge::{Result, ScanContext};

use super::{jsonl_output, scan};

pub fn run(ctx: &ScanContext, images: &[String], out: Option<&str>, partitions_out: Option<&str>) -> Result<()> {
    println!("[*] Enumerating locations");
    let report = scan(ctx, images);

    for drive in &report.drives {
        println!("{}", drive.drive);
        let Some(table) = &drive.table else { continue };
        match table.disk_guid() {
            Some(guid) => println!("    {} table, disk {{{}}}", table.kind(), guid),
            None => println!("    {} table", table.kind()),
        }
        for partition in table.partitions() {
            println!("    {}", partition);
        }
        for warning in table.warnings() {
            println!("    ! {}", warning);
        }
    }
    println!();
    for location in &report.locations {
        println!("[{}] {}", location.identifier(), location);
    }

    if let Some(path) = out {
        let mut writer = jsonl_output(Some(path))?;
        writer.write_all(report.locations.iter().map(LocationRow::from))?;
        writer.flush()?;
        println!("[+] {} location(s) written to {}", writer.written(), path);
    }
    if let Some(path) = partitions_out {
        let mut writer = jsonl_output(Some(path))?;
        for drive in &report.drives {
            if let Some(table) = &drive.table {
                writer.write_all(table.partitions().iter().map(|p| PartitionRow::new(drive.drive.path(), p)))?;
            }
        }
        writer.flush()?;
        println!("[+] {} partition(s) written to {}", writer.written(), path);
    }

    let failures = report.failures().count();
    if failures > 0 {
        println!("[!] {} location(s) could not be read", failures);
    }
    Ok(())
}
