use anyhow::{Context, Result};

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[(self.next_u64() % items.len() as u64) as usize]
    }
}

/// (zip, state, latitude, longitude)
const ZIPS: [(&str, &str, f64, f64); 8] = [
    ("01234", "MA", 42.5295, -71.9603),
    ("02139", "MA", 42.3647, -71.1042),
    ("07302", "NJ", 40.7178, -74.0431),
    ("10001", "NY", 40.7506, -73.9972),
    ("73301", "TX", 30.2672, -97.7431),
    ("77002", "TX", 29.7564, -95.3657),
    ("94103", "CA", 37.7726, -122.4099),
    ("90012", "CA", 34.0614, -118.2385),
];

/// A zip as it tends to arrive from spreadsheets: leading zeros lost,
/// written as a float, or kept as text.
fn messy_zip(zip: &str, rng: &mut SimpleRng) -> String {
    let stripped = zip.trim_start_matches('0');
    match rng.next_u64() % 3 {
        0 => stripped.to_string(),
        1 => format!("{stripped}.0"),
        _ => zip.to_string(),
    }
}

fn write_enrollment(path: &str, rows: usize, rng: &mut SimpleRng) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating enrollment CSV")?;
    writer.write_record(["id", "zip", "state", "enrolled", "amount", "signup"])?;

    for id in 0..rows {
        let (zip, state, _, _) = *rng.pick(&ZIPS);

        // 99950 and the last entry of ZIPS have no reference row.
        let zip = if rng.chance(0.03) {
            "99950".to_string()
        } else if rng.chance(0.03) {
            "unknown".to_string()
        } else if rng.chance(0.04) {
            String::new()
        } else {
            messy_zip(zip, rng)
        };

        let enrolled = if rng.chance(0.05) {
            ""
        } else if rng.chance(0.6) {
            "Yes"
        } else {
            "No"
        };

        let amount = if rng.chance(0.05) {
            String::new()
        } else if rng.chance(0.05) {
            "n/a".to_string()
        } else {
            format!("{}", 50 + rng.next_u64() % 450)
        };

        let signup = if rng.chance(0.1) {
            String::new()
        } else {
            format!("2024-{:02}-{:02}", 1 + rng.next_u64() % 12, 1 + rng.next_u64() % 28)
        };

        writer.write_record([
            id.to_string(),
            zip,
            state.to_string(),
            enrolled.to_string(),
            amount,
            signup,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_reference(path: &str) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating zip reference CSV")?;
    writer.write_record(["zip", "latitude", "longitude"])?;
    for (zip, _, lat, lon) in &ZIPS[..ZIPS.len() - 1] {
        writer.write_record([zip.to_string(), lat.to_string(), lon.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let mut rng = SimpleRng::new(42);
    let rows = 200;

    let data_path = "sample_enrollment.csv";
    write_enrollment(data_path, rows, &mut rng)?;
    println!("Wrote {rows} rows to {data_path}");

    let reference_path = "sample_zips.csv";
    write_reference(reference_path)?;
    println!("Wrote {} zips to {reference_path}", ZIPS.len() - 1);

    println!();
    println!("Try:");
    println!("  rusty-datavis inspect {data_path}");
    println!(
        "  rusty-datavis pivot {data_path} --type amount=float --rows state --cols enrolled --values amount --agg sum"
    );
    println!(
        "  rusty-datavis geo {data_path} --type enrolled=str --reference {reference_path} --zip zip --metric enrolled"
    );
    Ok(())
}
