//! Synthetic observation files for the integration tests

#![allow(dead_code)]

use iriscube::{CompressionMethod, ContainerWriter, Header, HeaderValue};
use ndarray::{Array2, Array3};
use std::path::{Path, PathBuf};

/// Missing-data value written by the instrument pipeline
pub const NULL: f32 = -200.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn text(header: &mut Header, key: &str, value: &str) {
    header.insert(key.to_string(), HeaderValue::Text(value.to_string()));
}

/// Primary header of a sit-and-stare slit-jaw observation
pub fn sji_primary() -> Header {
    let mut h = Header::new();
    text(&mut h, "INSTRUME", "SJI");
    h.insert("OBSID".into(), HeaderValue::Int(3600104003));
    text(&mut h, "OBS_DESC", "Large sit-and-stare 0.3x120 1s  Deep x 8");
    text(&mut h, "STARTOBS", "2014-03-29T14:09:38.830");
    text(&mut h, "ENDOBS", "2014-03-29T17:54:10.000");
    text(&mut h, "TDESC1", "SJI_1400");
    h
}

fn sji_records(n: usize) -> (Header, Array2<f64>) {
    let mut h = Header::new();
    h.insert("TIME".into(), HeaderValue::Int(0));
    h.insert("EXPTIMES".into(), HeaderValue::Int(1));
    h.insert("XCENIX".into(), HeaderValue::Int(2));
    h.insert("YCENIX".into(), HeaderValue::Int(3));
    let data = Array2::from_shape_fn((n, 4), |(s, c)| match c {
        0 => s as f64 * 12.0,
        1 => 8.0,
        2 => -300.0 + s as f64,
        _ => 150.0,
    });
    (h, data)
}

/// Write a slit-jaw file holding `frames`
pub fn write_sji(dir: &Path, name: &str, frames: &[Array2<f32>]) -> PathBuf {
    let (height, width) = frames[0].dim();
    let stack = Array3::from_shape_fn((frames.len(), height, width), |(s, y, x)| frames[s][[y, x]]);
    let (records, data) = sji_records(frames.len());

    let mut writer = ContainerWriter::new(sji_primary());
    writer.add_image_stack(Header::new(), &stack);
    writer
        .add_table(records, &data, CompressionMethod::Zstd)
        .expect("Failed to add record table");
    let path = dir.join(name);
    writer.write(&path).expect("Failed to write slit-jaw file");
    path
}

/// `height x width` image with valid data in `[y0, y1) x [x0, x1)`
pub fn framed(height: usize, width: usize, y0: usize, y1: usize, x0: usize, x1: usize) -> Array2<f32> {
    Array2::from_shape_fn((height, width), |(y, x)| {
        if (y0..y1).contains(&y) && (x0..x1).contains(&x) {
            10.0 + (x + y) as f32
        } else {
            NULL
        }
    })
}

/// Image filled with `value`
pub fn flat(height: usize, width: usize, value: f32) -> Array2<f32> {
    Array2::from_elem((height, width), value)
}

/// Write one file of a 4-step spectrograph raster with FUV and NUV channels
///
/// NUV pixel values are `file_index * 10 + step + 1`.
pub fn write_raster(dir: &Path, name: &str, file_index: usize) -> PathBuf {
    let mut primary = Header::new();
    text(&mut primary, "INSTRUME", "SPEC");
    primary.insert("OBSID".into(), HeaderValue::Int(3820259253));
    text(&mut primary, "OBS_DESC", "Large coarse 4-step raster 6x120 4s");
    text(&mut primary, "STARTOBS", "2014-09-06T11:23:39.000");
    text(&mut primary, "TDESC1", "C II 1336");
    text(&mut primary, "TDESC2", "Mg II k 2796");
    text(&mut primary, "TDET1", "FUV1");
    text(&mut primary, "TDET2", "NUV");
    primary.insert("TWAVE1".into(), HeaderValue::Float(1335.71));
    primary.insert("TWAVE2".into(), HeaderValue::Float(2796.2));

    let mut nuv_header = Header::new();
    nuv_header.insert("CDELT1".into(), HeaderValue::Float(0.025));
    nuv_header.insert("CRVAL2".into(), HeaderValue::Float(-1.5));

    let mut records = Header::new();
    for (col, key) in ["TIME", "EXPTIMEF", "EXPTIMEN", "XCENIX", "YCENIX", "DSRCNIX", "PC1_1IX"]
        .iter()
        .enumerate()
    {
        records.insert(key.to_string(), HeaderValue::Int(col as i64));
    }
    let data = Array2::from_shape_fn((4, 7), |(s, c)| match c {
        0 => (file_index * 4 + s) as f64 * 3.0,
        1 => 8.0,
        2 => 4.0,
        3 => 100.0 + s as f64,
        4 => 200.0,
        5 => 1.0,
        _ => 0.9,
    });

    let mut writer = ContainerWriter::new(primary);
    writer.add_image_stack(Header::new(), &Array3::from_elem((4, 6, 5), 50.0));
    writer.add_image_stack(
        nuv_header,
        &Array3::from_shape_fn((4, 6, 7), |(s, _, _)| (file_index * 10 + s + 1) as f32),
    );
    writer
        .add_table(records, &data, CompressionMethod::Deflate)
        .expect("Failed to add record table");
    writer.add_header(Header::new());
    let path = dir.join(name);
    writer.write(&path).expect("Failed to write raster file");
    path
}
