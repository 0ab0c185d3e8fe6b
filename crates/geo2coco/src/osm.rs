//! `extract`: OSM .pbf -> polygon table CSV (`building`, `geometry`, `osm_id`).
//!
//! Two passes over the file. Pass A keeps closed ways tagged `building=*` and
//! remembers the node ids they reference; pass B resolves those nodes. Rings
//! whose nodes are not all present (clipped extracts) are dropped.

use anyhow::{Context, Result};
use geo::{coord, Intersects, LineString, Polygon, Rect};
use log::{info, warn};
use nohash_hasher::BuildNoHashHasher;
use osmpbf::{Element, ElementReader, Way};
use smallvec::SmallVec;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use wkt::ToWkt;

use crate::config::ExtractArgs;

type IdSet = hashbrown::HashSet<i64, BuildNoHashHasher<i64>>;
type NodeMap = hashbrown::HashMap<i64, (f64, f64), BuildNoHashHasher<i64>>;

/// Lon/lat box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBboxDeg {
    pub lon_min: f64,
    pub lat_min: f64,
    pub lon_max: f64,
    pub lat_max: f64,
}

impl GeoBboxDeg {
    fn rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.lon_min, y: self.lat_min },
            coord! { x: self.lon_max, y: self.lat_max },
        )
    }
}

impl FromStr for GeoBboxDeg {
    type Err = String;

    /// `minlon,minlat,maxlon,maxlat`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| format!("invalid bbox '{s}': {e}"))?;

        let [lon_min, lat_min, lon_max, lat_max] = parts[..] else {
            return Err(format!("bbox needs 4 values, got {}", parts.len()));
        };
        if lon_min > lon_max || lat_min > lat_max {
            return Err(format!("bbox '{s}' has min > max"));
        }

        Ok(Self {
            lon_min,
            lat_min,
            lon_max,
            lat_max,
        })
    }
}

impl fmt::Display for GeoBboxDeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.lon_min, self.lat_min, self.lon_max, self.lat_max
        )
    }
}

/// Rate-limited progress logging for long element scans.
struct Tick {
    start: Instant,
    last: Instant,
    every: usize,
}

impl Tick {
    fn new(every: usize) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            every: every.max(1),
        }
    }

    /// True on multiples of `every`, at most once per 200 ms.
    fn should(&mut self, count: usize) -> bool {
        const MIN_INTERVAL: Duration = Duration::from_millis(200);
        if count % self.every == 0 && self.last.elapsed() >= MIN_INTERVAL {
            self.last = Instant::now();
            return true;
        }
        false
    }

    /// Million items per second since construction.
    fn rate_mps(&self, count: usize) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64().max(1e-9);
        count as f64 / 1_000_000.0 / elapsed
    }
}

/// A closed building way before its nodes are resolved.
struct BuildingWay {
    id: i64,
    label: String,
    refs: SmallVec<[i64; 16]>,
}

/// The `building` tag value, if the way is a closed building outline.
fn building_label(way: &Way) -> Option<String> {
    let label = way
        .tags()
        .find_map(|(k, v)| (k == "building").then_some(v))?
        .trim();
    (!label.is_empty() && label != "no").then(|| label.to_owned())
}

fn is_closed_ring(refs: &[i64]) -> bool {
    refs.len() >= 4 && refs.first() == refs.last()
}

#[derive(Debug, Default)]
struct ExtractStats {
    ways_seen: usize,
    unclosed: usize,
    missing_nodes: usize,
    outside_bbox: usize,
    written: usize,
}

pub fn extract(args: &ExtractArgs) -> Result<()> {
    let pbf = &args.pbf;
    let mut stats = ExtractStats::default();

    // Pass A: building ways and the nodes they need.
    let mut buildings: Vec<BuildingWay> = Vec::new();
    let mut wanted: IdSet = IdSet::with_hasher(BuildNoHashHasher::default());
    let mut tick = Tick::new(args.log_every);

    ElementReader::from_path(pbf)
        .with_context(|| format!("opening {}", pbf.display()))?
        .for_each(|elem| {
            let Element::Way(way) = elem else {
                return;
            };
            stats.ways_seen += 1;

            if let Some(label) = building_label(&way) {
                let refs: SmallVec<[i64; 16]> = way.refs().collect();
                if is_closed_ring(&refs) {
                    wanted.extend(refs.iter().copied());
                    buildings.push(BuildingWay {
                        id: way.id(),
                        label,
                        refs,
                    });
                } else {
                    stats.unclosed += 1;
                }
            }

            if tick.should(stats.ways_seen) {
                info!(
                    "Pass A: ways seen {:>11}, buildings {:>9}, rate {:5.2} M/s",
                    stats.ways_seen,
                    buildings.len(),
                    tick.rate_mps(stats.ways_seen)
                );
            }
        })
        .with_context(|| format!("reading ways from {}", pbf.display()))?;

    info!(
        "Pass A done: {} building ways, {} nodes to resolve",
        buildings.len(),
        wanted.len()
    );

    // Pass B: resolve the referenced nodes.
    let mut nodes: NodeMap = NodeMap::with_capacity_and_hasher(wanted.len(), BuildNoHashHasher::default());
    let mut seen_nodes = 0usize;
    let mut tick = Tick::new(args.log_every);

    ElementReader::from_path(pbf)
        .with_context(|| format!("opening {}", pbf.display()))?
        .for_each(|elem| {
            let (id, lon, lat) = match elem {
                Element::Node(node) => (node.id(), node.lon(), node.lat()),
                Element::DenseNode(dn) => (dn.id(), dn.lon(), dn.lat()),
                _ => return,
            };
            seen_nodes += 1;

            if wanted.contains(&id) {
                nodes.insert(id, (lon, lat));
            }

            if tick.should(seen_nodes) {
                info!(
                    "Pass B: nodes seen {:>11}, resolved {:>11}, rate {:5.2} M/s",
                    seen_nodes,
                    nodes.len(),
                    tick.rate_mps(seen_nodes)
                );
            }
        })
        .with_context(|| format!("reading nodes from {}", pbf.display()))?;

    write_table(&args.output, &buildings, &nodes, args.bbox, &mut stats)?;

    info!(
        "Wrote {} buildings to {} ({} unclosed, {} with missing nodes, {} outside bbox)",
        stats.written,
        args.output.display(),
        stats.unclosed,
        stats.missing_nodes,
        stats.outside_bbox
    );
    Ok(())
}

fn resolve_ring(refs: &[i64], nodes: &NodeMap) -> Option<Polygon<f64>> {
    let coords: Option<Vec<(f64, f64)>> = refs.iter().map(|id| nodes.get(id).copied()).collect();
    Some(Polygon::new(LineString::from(coords?), vec![]))
}

fn write_table(
    output: &Path,
    buildings: &[BuildingWay],
    nodes: &NodeMap,
    bbox: Option<GeoBboxDeg>,
    stats: &mut ExtractStats,
) -> Result<()> {
    if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("creating {}", output.display()))?;
    writer.write_record(["building", "geometry", "osm_id"])?;

    let bbox_rect = bbox.map(|b| b.rect());

    for way in buildings {
        let Some(polygon) = resolve_ring(&way.refs, nodes) else {
            stats.missing_nodes += 1;
            continue;
        };

        if let Some(rect) = &bbox_rect {
            if !polygon.intersects(rect) {
                stats.outside_bbox += 1;
                continue;
            }
        }

        writer.write_record([
            way.label.as_str(),
            polygon.wkt_string().as_str(),
            way.id.to_string().as_str(),
        ])?;
        stats.written += 1;
    }

    if stats.missing_nodes > 0 {
        warn!(
            "{} building ways reference nodes missing from the extract",
            stats.missing_nodes
        );
    }

    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    Ok(())
}
