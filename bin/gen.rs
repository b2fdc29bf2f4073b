use clap::{Arg, Command};
use std::io::{self, Write};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write synthetic installed-apps TSV to stdout (pipe through gzip)")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("bad_every")
                .long("bad-every")
                .help("Emit a malformed line every N rows (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(Arg::new("types").long("types").default_value("idfa,gaid,adid,dvid"))
        .arg(Arg::new("apps").long("apps").value_parser(clap::value_parser!(usize)).default_value("8"))
        .get_matches();

    let rows: u64 = matches.get_one("rows").copied().unwrap_or(0);
    let bad_every: u64 = matches.get_one("bad_every").copied().unwrap_or(0);
    let apps: usize = matches.get_one("apps").copied().unwrap_or(8);
    let types: Vec<&str> = matches
        .get_one::<String>("types")
        .map(|s| s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    anyhow::ensure!(!types.is_empty(), "--types must name at least one device type");

    let mut out = io::BufWriter::new(io::stdout().lock());

    // Deterministic data: ids and app lists derive from the row number
    for i in 0..rows {
        let dev_type = types[(i % types.len() as u64) as usize];
        if bad_every > 0 && i % bad_every == bad_every - 1 {
            writeln!(&mut out, "{dev_type}\t{:016x}\tnot-a-lat", mix(i))?;
            continue;
        }

        let h = mix(i);
        let lat = (h % 180_000) as f64 / 1000.0 - 90.0;
        let lon = ((h >> 20) % 360_000) as f64 / 1000.0 - 180.0;
        write!(&mut out, "{dev_type}\t{h:016x}\t{lat:.3}\t{lon:.3}\t")?;
        for a in 0..apps as u64 {
            if a > 0 {
                write!(&mut out, ",")?;
            }
            write!(&mut out, "{}", mix(i ^ (a << 40)) % 10_000)?;
        }
        writeln!(&mut out)?;
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}

/// splitmix64 finalizer
fn mix(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
