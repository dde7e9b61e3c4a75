// src/bin/weightpack-inspect.rs
// ============================================================================
// WEIGHTPACK INSPECTOR - Inspecciona un archivo ZIP generado
// ============================================================================
//
// Uso: weightpack-inspect modelo.zip [--verify] [--json]
//
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use serde::Serialize;

use weightpack::dictionary::{split_entry_name, ValidationReport};
use weightpack::encoder::TypePrefix;
use weightpack::ZipArchiveReader;

#[derive(Parser)]
#[command(name = "weightpack-inspect")]
#[command(about = "Inspect a weightpack ZIP archive")]
struct Args {
    /// Archive to inspect
    file: PathBuf,

    /// Re-check the CRC-32 of every entry
    #[arg(long)]
    verify: bool,

    /// Print a JSON manifest instead of the table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    name: &'a str,
    size: u64,
    crc32: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    crc_ok: Option<bool>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    file: String,
    file_size: u64,
    entries: Vec<ManifestEntry<'a>>,
    dictionary: &'a ValidationReport,
}

/// Por prefijo: (entradas, bytes)
#[derive(Default)]
struct PrefixSummary {
    count: usize,
    bytes: u64,
}

fn format_size(size: u64) -> String {
    if size == 0 {
        "vacío".to_string()
    } else if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else if size < 1024 * 1024 * 1024 {
        format!("{:.1} MB", size as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", size as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}

fn make_bar(size: u64, max_size: u64, width: usize) -> String {
    if max_size == 0 || size == 0 {
        "░".repeat(width)
    } else {
        let ratio = (size as f64 / max_size as f64).min(1.0);
        // Mínimo 1 bloque si hay datos
        let filled = ((ratio * width as f64) as usize).max(1);
        "█".repeat(filled) + &"░".repeat(width.saturating_sub(filled))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let reader = ZipArchiveReader::open(&args.file)?;

    let report = ValidationReport::from_names(reader.entries().iter().map(|e| e.name.as_str()));

    let mut crc_results: Vec<Option<bool>> = vec![None; reader.len()];
    if args.verify {
        for (slot, entry) in crc_results.iter_mut().zip(reader.entries()) {
            *slot = Some(reader.verify(entry)?);
        }
    }
    let crc_failures: Vec<&str> = reader
        .entries()
        .iter()
        .zip(&crc_results)
        .filter(|(_, ok)| **ok == Some(false))
        .map(|(e, _)| e.name.as_str())
        .collect();

    if args.json {
        let manifest = Manifest {
            file: args.file.display().to_string(),
            file_size: reader.file_size(),
            entries: reader
                .entries()
                .iter()
                .zip(&crc_results)
                .map(|(e, ok)| ManifestEntry {
                    name: &e.name,
                    size: e.size,
                    crc32: format!("{:08x}", e.crc32),
                    crc_ok: *ok,
                })
                .collect(),
            dictionary: &report,
        };
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        print_table(&args, &reader, &report, &crc_failures);
    }

    if !crc_failures.is_empty() {
        bail!("{} entries failed CRC-32 verification", crc_failures.len());
    }
    if !report.is_valid() {
        bail!("{} entries outside the dictionary", report.invalid.len() + report.conflicting.len());
    }
    Ok(())
}

fn print_table(args: &Args, reader: &ZipArchiveReader, report: &ValidationReport, crc_failures: &[&str]) {
    let mut summary: BTreeMap<&'static str, PrefixSummary> = BTreeMap::new();
    for entry in reader.entries() {
        let prefix = split_entry_name(&entry.name).map_or("(otro)", |(p, _)| p.as_str());
        let s = summary.entry(prefix).or_default();
        s.count += 1;
        s.bytes += entry.size;
    }
    let payload: u64 = summary.values().map(|s| s.bytes).sum();

    println!();
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  WEIGHTPACK INSPECTOR");
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  Archivo:      {}", args.file.display());
    println!("  Tamaño real:  {}", format_size(reader.file_size()));
    println!("  Entradas:     {}", reader.len());
    println!("  Capas:        {}", report.layer_count());
    println!();

    // ═══════════════════════════════════════════════════════════════
    // PREFIJOS
    // ═══════════════════════════════════════════════════════════════
    println!("┌──────────────────────────────────────────────────────────────────────────────┐");
    println!("│ PREFIJOS DE TIPO                                                             │");
    println!("├──────────────────────────────────────────────────────────────────────────────┤");
    for prefix in TypePrefix::ALL.iter().map(|p| p.as_str()).chain(["(otro)"]) {
        if let Some(s) = summary.get(prefix) {
            println!(
                "│  {:8} {:5} entradas  [{}] {:>10}",
                prefix,
                s.count,
                make_bar(s.bytes, payload, 30),
                format_size(s.bytes)
            );
        }
    }
    println!("└──────────────────────────────────────────────────────────────────────────────┘");
    println!();

    // ═══════════════════════════════════════════════════════════════
    // DICCIONARIO
    // ═══════════════════════════════════════════════════════════════
    println!("┌──────────────────────────────────────────────────────────────────────────────┐");
    println!("│ DICCIONARIO                                                                  │");
    println!("├──────────────────────────────────────────────────────────────────────────────┤");
    println!("│  Válidas:    {}", report.valid);
    println!("│  Inválidas:  {}", report.invalid.len());
    for name in report.invalid.iter().take(10) {
        println!("│    ✗ {}", name);
    }
    for path in &report.conflicting {
        println!("│    ✗ {} (más de un prefijo)", path);
    }
    let missing = report.missing_layers();
    if !missing.is_empty() {
        println!("│  Capas ausentes: {:?}", missing);
    }
    println!("└──────────────────────────────────────────────────────────────────────────────┘");

    if args.verify {
        println!();
        if crc_failures.is_empty() {
            println!("  CRC-32: ✓ {} entradas verificadas", reader.len());
        } else {
            println!("  CRC-32: ✗ {} entradas corruptas", crc_failures.len());
            for name in crc_failures.iter().take(10) {
                println!("    ✗ {}", name);
            }
        }
    }
    println!();
}
