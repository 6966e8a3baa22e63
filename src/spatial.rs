use crate::db::ConnectionParams;
use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use tracing::{debug, error};

/// Metadata of one layer in a spatial data file, as reported by `ogrinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub layer: String,
    pub features: i64,
    pub geometry: Option<String>,
    pub fields: Vec<(String, String)>,
}

/// Reads layer metadata from a spatial data file. With `layer` given, only
/// that layer is inspected; otherwise all layers are returned.
pub fn layers(path: &Path, layer: Option<&str>) -> Result<Vec<LayerInfo>> {
    let mut command = Command::new("ogrinfo");
    command.args(["-al", "-so", "-ro"]).arg(path);
    if let Some(layer) = layer {
        command.arg(layer);
    }
    let output = run(command, "ogrinfo")?;
    Ok(parse_layers(&output))
}

/// The first (usually only) layer of a spatial data file.
pub fn layer_info(path: &Path, layer: Option<&str>) -> Result<LayerInfo> {
    layers(path, layer)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::LayerNotFound(path.to_path_buf()))
}

/// Imports a spatial file's layer into a database table via `ogr2ogr`.
pub fn import(params: &ConnectionParams, path: &Path, layer: &str, table: &str, overwrite: bool) -> Result<()> {
    let mut command = Command::new("ogr2ogr");
    if overwrite {
        command.arg("-overwrite");
    }
    command
        .args(["-preserve_fid", "-f", "PostgreSQL"])
        .arg(params.ogr_dsn())
        .arg(path)
        .args(["-nln", table])
        .arg(layer);
    run(command, "ogr2ogr").map(drop)
}

/// Exports the result of `sql` into a spatial file via `ogr2ogr`.
pub fn export(params: &ConnectionParams, sql: &str, path: &Path, layer: Option<&str>) -> Result<()> {
    let mut command = Command::new("ogr2ogr");
    command
        .args(["-overwrite", "-preserve_fid"])
        .arg(path)
        .arg(params.ogr_dsn());
    if let Some(layer) = layer {
        command.args(["-nln", layer]);
    }
    command.args(["-sql", sql]);
    run(command, "ogr2ogr").map(drop)
}

fn run(mut command: Command, program: &'static str) -> Result<String> {
    debug!("running {command:?}");
    let output = command.output()?;
    if !output.status.success() {
        error!("{program} failed: {}", String::from_utf8_lossy(&output.stderr));
        return Err(Error::ToolFailure(program, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

static FEATURE_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Feature Count:\s*(\d+)").unwrap());
static FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_ \-]*):\s*([A-Za-z0-9]+)\s*\(\d+\.\d+\)").unwrap());

fn parse_layers(output: &str) -> Vec<LayerInfo> {
    let mut layers = Vec::new();
    let mut current: Option<LayerInfo> = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Layer name:") {
            if let Some(layer) = current.take() {
                layers.push(layer);
            }
            current = Some(LayerInfo {
                layer: name.trim().to_owned(),
                features: 0,
                geometry: None,
                fields: Vec::new(),
            });
            continue;
        }
        let Some(layer) = current.as_mut() else {
            continue;
        };
        if let Some(captures) = FEATURE_COUNT.captures(line) {
            layer.features = captures[1].parse().unwrap_or(0);
        } else if let Some(geometry) = line.strip_prefix("Geometry:") {
            layer.geometry = Some(geometry.trim().replace(' ', "").to_uppercase());
        } else if let Some(captures) = FIELD.captures(line) {
            layer.fields.push((captures[1].trim().to_lowercase(), captures[2].to_owned()));
        }
    }
    if let Some(layer) = current.take() {
        layers.push(layer);
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;

    const OGRINFO_OUTPUT: &str = "\
INFO: Open of `loggedpoint.gpkg'
      using driver `GPKG' successful.

Layer name: loggedpoint2024-05-01
Geometry: Point
Feature Count: 2
Extent: (115.443420, -33.959171) - (128.034407, -15.443224)
Layer SRS WKT:
GEOGCS[\"WGS 84\",
    DATUM[\"WGS_1984\"]]
FID Column = fid
Geometry Column = point
id: Integer64 (0.0)
heading: Real (0.0)
velocity: Real (0.0)
seen: Integer64 (0.0)
deviceid: String (0.0)
registration: String (0.0)
";

    #[test]
    fn parses_an_ogrinfo_layer_block() {
        let layers = parse_layers(OGRINFO_OUTPUT);
        assert_eq!(layers.len(), 1);

        let layer = &layers[0];
        assert_eq!(layer.layer, "loggedpoint2024-05-01");
        assert_eq!(layer.features, 2);
        assert_eq!(layer.geometry.as_deref(), Some("POINT"));
        assert_eq!(layer.fields[0], (String::from("id"), String::from("Integer64")));
        assert_eq!(layer.fields.len(), 6);
    }

    #[test]
    fn parses_multiple_layer_blocks() {
        let doubled = format!("{OGRINFO_OUTPUT}\n{}", OGRINFO_OUTPUT.replace("2024-05-01", "2024-05-02"));
        let layers = parse_layers(&doubled);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].layer, "loggedpoint2024-05-02");
    }

    #[test]
    fn empty_output_has_no_layers() {
        assert!(parse_layers("INFO: nothing here\n").is_empty());
    }
}
