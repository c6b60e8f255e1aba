use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use hedwig_core::product::ProductRole;
use hedwig_core::{Attachment, AttachmentKind};

use super::{ProcessError, ProcessOutput, ProductFile, Processor};

/// Deepest HEALPix order a MOC may use.
pub const MAX_ORDER: u8 = 29;

/// Cells in the whole sky at `order`.
fn npix(order: u8) -> u64 {
    12u64 << (2 * order as u32)
}

/// A sky coverage map normalised to disjoint, sorted cell ranges at
/// [`MAX_ORDER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moc {
    /// Highest order the document mentions.
    pub max_order: u8,
    ranges: Vec<Range<u64>>,
}

impl Moc {
    fn from_cells(max_order: u8, cells: Vec<(u8, Range<u64>)>) -> Self {
        let mut ranges: Vec<Range<u64>> = cells
            .into_iter()
            .map(|(order, cells)| {
                let shift = 2 * (MAX_ORDER - order) as u32;
                (cells.start << shift)..(cells.end << shift)
            })
            .collect();
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        Self {
            max_order,
            ranges: merged,
        }
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    /// Number of distinct cells at `max_order` covered.
    pub fn cell_count(&self) -> u64 {
        let shift = 2 * (MAX_ORDER - self.max_order) as u32;
        self.ranges.iter().map(|r| (r.end - r.start) >> shift).sum()
    }

    pub fn sky_fraction(&self) -> f64 {
        let covered: u64 = self.ranges.iter().map(|r| r.end - r.start).sum();
        covered as f64 / npix(MAX_ORDER) as f64
    }

    pub fn area_sq_deg(&self) -> f64 {
        let full_sky = 4.0 * PI * (180.0 / PI).powi(2);
        self.sky_fraction() * full_sky
    }
}

/// Parse a MOC in its ASCII serialisation (`1/1,3-4 2/4 25 12-14`), or the
/// JSON one (`{"1": [1, 3, 4], "2": [4, 25]}`).
pub fn parse_moc(text: &str) -> Result<Moc, ProcessError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with("SIMPLE") {
        return Err(ProcessError::Invalid(
            "FITS MOC files are not supported, upload the ASCII serialisation".into(),
        ));
    }
    let (max_order, cells) = if trimmed.starts_with('{') {
        parse_json(trimmed)?
    } else {
        parse_ascii(trimmed)?
    };
    if cells.is_empty() {
        return Err(ProcessError::Invalid("coverage map contains no cells".into()));
    }
    Ok(Moc::from_cells(max_order, cells))
}

type Cells = (u8, Vec<(u8, Range<u64>)>);

fn parse_ascii(text: &str) -> Result<Cells, ProcessError> {
    let mut order: Option<u8> = None;
    let mut max_order = 0;
    let mut cells = Vec::new();

    let body = text
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    let tokens = body
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty());

    for token in tokens {
        let cell_spec = match token.split_once('/') {
            Some((o, rest)) => {
                let o = parse_order(o)?;
                max_order = max_order.max(o);
                order = Some(o);
                rest
            }
            None => token,
        };
        if cell_spec.is_empty() {
            continue;
        }
        let Some(o) = order else {
            return Err(ProcessError::Invalid(format!(
                "cell '{token}' appears before any order"
            )));
        };
        cells.push((o, parse_cells(o, cell_spec)?));
    }
    Ok((max_order, cells))
}

fn parse_json(text: &str) -> Result<Cells, ProcessError> {
    let doc: BTreeMap<String, Vec<u64>> = serde_json::from_str(text)
        .map_err(|e| ProcessError::Invalid(format!("invalid JSON coverage map: {e}")))?;
    let mut max_order = 0;
    let mut cells = Vec::new();
    for (o, ipixes) in doc {
        let o = parse_order(&o)?;
        max_order = max_order.max(o);
        for ipix in ipixes {
            check_cell(o, ipix)?;
            cells.push((o, ipix..ipix + 1));
        }
    }
    Ok((max_order, cells))
}

fn parse_order(s: &str) -> Result<u8, ProcessError> {
    let order: u8 = s
        .parse()
        .map_err(|_| ProcessError::Invalid(format!("invalid order '{s}'")))?;
    if order > MAX_ORDER {
        return Err(ProcessError::Invalid(format!(
            "order {order} exceeds the maximum of {MAX_ORDER}"
        )));
    }
    Ok(order)
}

/// `n` or inclusive `a-b`.
fn parse_cells(order: u8, spec: &str) -> Result<Range<u64>, ProcessError> {
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| ProcessError::Invalid(format!("invalid cell '{spec}'")))
    };
    let (first, last) = match spec.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let n = parse(spec)?;
            (n, n)
        }
    };
    if first > last {
        return Err(ProcessError::Invalid(format!("empty cell range '{spec}'")));
    }
    check_cell(order, last)?;
    Ok(first..last + 1)
}

fn check_cell(order: u8, ipix: u64) -> Result<(), ProcessError> {
    if ipix >= npix(order) {
        return Err(ProcessError::Invalid(format!(
            "cell {ipix} does not exist at order {order}"
        )));
    }
    Ok(())
}

/// The coverage summary stored next to a MOC.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageSummary {
    pub max_order: u8,
    pub cells: u64,
    pub ranges: usize,
    pub sky_fraction: f64,
    pub area_sq_deg: f64,
}

impl From<&Moc> for CoverageSummary {
    fn from(moc: &Moc) -> Self {
        Self {
            max_order: moc.max_order,
            cells: moc.cell_count(),
            ranges: moc.ranges().len(),
            sky_fraction: moc.sky_fraction(),
            area_sq_deg: moc.area_sq_deg(),
        }
    }
}

/// Validates proposal coverage maps and summarises their sky area.
#[derive(Debug, Default)]
pub struct CoverageProcessor;

#[async_trait]
impl Processor for CoverageProcessor {
    fn kind(&self) -> AttachmentKind {
        AttachmentKind::ProposalCoverage
    }

    async fn process(
        &self,
        _attachment: &Attachment,
        content: Bytes,
    ) -> Result<ProcessOutput, ProcessError> {
        let text = std::str::from_utf8(&content)
            .map_err(|_| ProcessError::Invalid("coverage map is not text".into()))?;
        let moc = parse_moc(text)?;
        let summary = CoverageSummary::from(&moc);
        let json = serde_json::to_vec_pretty(&summary)
            .map_err(|e| ProcessError::Invalid(format!("cannot encode summary: {e}")))?;

        Ok(ProcessOutput {
            summary: format!(
                "{} cells at order {}, {:.3} sq deg",
                summary.cells, summary.max_order, summary.area_sq_deg
            ),
            products: vec![ProductFile {
                role: ProductRole::CoverageSummary,
                page: None,
                name: "coverage.json".into(),
                data: Bytes::from(json),
            }],
        })
    }
}
