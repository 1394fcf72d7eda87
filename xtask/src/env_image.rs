// Licensed under the Apache-2.0 license

//! Host-side creation and checking of boot-loader env images, so packages
//! can ship an env partition image built from a readable text file.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Entries of an env text file: one `key=value` per line. Blank lines and
/// lines starting with `#` are skipped.
fn parse_entries(text: &str) -> Result<Vec<String>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            if line.contains('=') {
                Ok(line.to_string())
            } else {
                Err(anyhow!("line {n}: expected key=value, got {line:?}"))
            }
        })
        .collect()
}

pub(crate) fn create(input: &Path, output: &Path) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read '{}'", input.display()))?;
    let entries = parse_entries(&text)?;
    let blob = qspi::env::encode(&entries)?;
    std::fs::write(output, &blob)
        .with_context(|| format!("Failed to write '{}'", output.display()))?;
    println!(
        "Wrote {} entries ({} bytes) to {}",
        entries.len(),
        blob.len(),
        output.display()
    );
    Ok(())
}

pub(crate) fn verify(file: &Path) -> Result<()> {
    let data =
        std::fs::read(file).with_context(|| format!("Failed to read '{}'", file.display()))?;
    let env = qspi::env::decode(&data)?;
    for entry in env.entries.iter() {
        println!("{entry}");
    }
    println!("Env image {} is valid", file.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_entries() {
        let text = "# defaults\nbaudrate=115200\n\n  bootdelay=3  \nbootargs=console=ttymxc0 ip=dhcp\n";
        assert_eq!(
            parse_entries(text).unwrap(),
            vec![
                "baudrate=115200",
                "bootdelay=3",
                "bootargs=console=ttymxc0 ip=dhcp"
            ]
        );
        let err = parse_entries("baudrate=115200\nbogus\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn test_create_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("env.txt");
        let output = dir.path().join("env.bin");
        std::fs::write(&input, "baudrate=115200\nbootdelay=3\n").unwrap();
        create(&input, &output).unwrap();
        verify(&output).unwrap();

        let mut blob = std::fs::read(&output).unwrap();
        let env = qspi::env::decode(&blob).unwrap();
        assert_eq!(env.get("bootdelay"), Some("3"));

        blob[10] ^= 0xff;
        std::fs::write(&output, &blob).unwrap();
        assert!(verify(&output).is_err());
    }
}
