//! Energy report rendering.

use nodepower_client::JobWindow;
use nodepower_core::HostEnergy;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Writes the job window header.
pub fn write_job_window<W: Write>(out: &mut W, window: &JobWindow) -> io::Result<()> {
    writeln!(out, "# start: {}", window.start)?;
    writeln!(out, "# end: {}", window.end)?;
    writeln!(out, "# nodes: {}", window.nodes.join(" "))
}

/// Writes one block per host.
///
/// Hosts without samples report zero energy.
pub fn write_report<W: Write>(
    out: &mut W,
    hosts: &[String],
    results: &BTreeMap<String, HostEnergy>,
    energy_only: bool,
) -> io::Result<()> {
    for host in hosts {
        let empty;
        let energy = match results.get(host) {
            Some(energy) => energy,
            None => {
                empty = HostEnergy::empty(host.as_str());
                &empty
            }
        };

        if !energy_only {
            writeln!(out, "# time_[s] power_[W]_{}", host)?;
            for sample in &energy.samples {
                writeln!(
                    out,
                    "{} {} {}",
                    sample.timestamp, sample.power_watts, sample.host
                )?;
            }
        }
        writeln!(out, "host: {} energy_[J]: {}", host, energy.energy_joules)?;
        writeln!(out)?;
    }
    out.flush()
}
