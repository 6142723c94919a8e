//! Post-run statistics: load balance, an SVG timeline and a YAML report.

use std::fmt::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use colourado::{ColorPalette, PaletteType};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator::Instance;
use crate::error::{Result, SchedulerError};

const SVG_WIDTH: f64 = 1000.0;
const SVG_HEIGHT: f64 = 800.0;
const CAPTION_HEIGHT: f64 = 40.0;

pub struct RunStatistics {
    historic: Vec<Instance>,
    pool_size: usize,
    total_elapsed_ms: u64,
}

/// Summary of one finished instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub id: String,
    pub start_rank: usize,
    pub ranks: usize,
    pub start_offset_ms: u64,
    pub elapsed_ms: u64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pool_size: usize,
    pub total_elapsed_ms: u64,
    pub load_balance_ratio: f64,
    pub failed_jobs: usize,
    pub instances: Vec<InstanceReport>,
}

impl RunStatistics {
    /// `pool_size` is the number of ranks jobs could run on, `total_elapsed`
    /// the wall-clock time of the whole run.
    pub fn new(historic: Vec<Instance>, pool_size: usize, total_elapsed: Duration) -> Self {
        Self {
            historic,
            pool_size,
            total_elapsed_ms: total_elapsed.as_millis() as u64,
        }
    }

    pub fn historic(&self) -> &[Instance] {
        &self.historic
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        self.total_elapsed_ms
    }

    /// Share of the available rank-time spent running jobs.
    pub fn load_balance_ratio(&self) -> f64 {
        let busy: u64 = self
            .historic
            .iter()
            .map(|instance| instance.elapsed_ms() * instance.rank_count() as u64)
            .sum();
        let available = self.pool_size as u64 * self.total_elapsed_ms;
        if available == 0 {
            return 0.0;
        }
        busy as f64 / available as f64
    }

    pub fn failed_jobs(&self) -> usize {
        self.historic.iter().filter(|i| !i.succeeded()).count()
    }

    pub fn print_general_statistics(&self) {
        info!(
            jobs = self.historic.len(),
            failed = self.failed_jobs(),
            "Finished running commands. Total elapsed time: {}s",
            self.total_elapsed_ms / 1000
        );
        info!("Load balance ratio: {:.4}", self.load_balance_ratio());
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            pool_size: self.pool_size,
            total_elapsed_ms: self.total_elapsed_ms,
            load_balance_ratio: self.load_balance_ratio(),
            failed_jobs: self.failed_jobs(),
            instances: self
                .historic
                .iter()
                .map(|instance| InstanceReport {
                    id: instance.id().to_string(),
                    start_rank: instance.start_rank(),
                    ranks: instance.rank_count(),
                    start_offset_ms: instance.start_offset_ms(),
                    elapsed_ms: instance.elapsed_ms(),
                    exit_code: instance.exit_code(),
                })
                .collect(),
        }
    }

    /// Renders one rectangle per instance: ranks on the x axis, time on the y axis.
    pub fn render_svg(&self) -> Result<String> {
        let mut svg = String::new();
        self.write_svg(&mut svg)
            .map_err(|e| SchedulerError::Statistics(format!("rendering svg: {e}")))?;
        Ok(svg)
    }

    fn write_svg(&self, svg: &mut impl Write) -> fmt::Result {
        let columns = (self.pool_size + 1) as f64;
        let rows = self.total_elapsed_ms.max(1) as f64;
        let x_scale = SVG_WIDTH / columns;
        let y_scale = SVG_HEIGHT / rows;
        let colors =
            ColorPalette::new(self.historic.len().max(1) as u32, PaletteType::Random, false).colors;

        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}">"#,
            SVG_WIDTH,
            SVG_HEIGHT + CAPTION_HEIGHT
        )?;
        writeln!(
            svg,
            r#"<text x="10" y="{}" font-size="20">t = {}s, lb = {:.4}</text>"#,
            CAPTION_HEIGHT * 0.7,
            self.total_elapsed_ms / 1000,
            self.load_balance_ratio()
        )?;
        for (instance, color) in self.historic.iter().zip(colors) {
            writeln!(
                svg,
                r##"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="#{:02x}{:02x}{:02x}" stroke="black" stroke-width="0.5"><title>{}</title></rect>"##,
                instance.start_rank() as f64 * x_scale,
                CAPTION_HEIGHT + instance.start_offset_ms() as f64 * y_scale,
                instance.rank_count() as f64 * x_scale,
                instance.elapsed_ms() as f64 * y_scale,
                (color.red * 255.0) as u8,
                (color.green * 255.0) as u8,
                (color.blue * 255.0) as u8,
                instance.id()
            )?;
        }
        writeln!(svg, "</svg>")
    }

    pub fn export_svg(&self, path: &Path) -> Result<()> {
        info!(path = ?path, "Saving svg output");
        std::fs::write(path, self.render_svg()?)
            .map_err(|e| SchedulerError::Statistics(format!("{}: {e}", path.display())))
    }

    pub fn export_report(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.report())
            .map_err(|e| SchedulerError::Statistics(e.to_string()))?;
        std::fs::write(path, yaml)
            .map_err(|e| SchedulerError::Statistics(format!("{}: {e}", path.display())))
    }

    /// Writes the SVG and the report into `output_dir` without overwriting
    /// earlier runs. Returns the paths written, or `None` if nothing ran.
    pub fn export(&self, output_dir: &Path) -> Result<Option<(PathBuf, PathBuf)>> {
        if self.historic.is_empty() {
            return Ok(None);
        }
        let svg = incremental_path(output_dir, "statistics", "svg");
        self.export_svg(&svg)?;
        let report = incremental_path(output_dir, "report", "yaml");
        self.export_report(&report)?;
        Ok(Some((svg, report)))
    }
}

/// First of `stem.ext`, `stem_1.ext`, `stem_2.ext`, ... that does not exist in `dir`.
pub fn incremental_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|i| dir.join(format!("{stem}_{i}.{ext}")))
        .find(|path| !path.exists())
        .unwrap_or(first)
}
