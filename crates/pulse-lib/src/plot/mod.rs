use crate::signal::{ConditionedSample, PeakEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Axis {
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub width: f32,
    pub color: Color,
}

/// 0xRRGGBB
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(&self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub style: Style,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Series {
    Line(LineSeries),
    /// Unconnected markers, e.g. detected beats.
    Points(LineSeries),
}

impl Series {
    pub fn points(&self) -> &[[f64; 2]] {
        match self {
            Series::Line(s) | Series::Points(s) => &s.points,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub title: Option<String>,
    pub x: Axis,
    pub y: Axis,
    pub series: Vec<Series>,
}

impl Figure {
    pub fn new(title: impl Into<Option<String>>) -> Self {
        Self {
            title: title.into(),
            x: Axis { label: None },
            y: Axis { label: None },
            series: Vec::new(),
        }
    }

    pub fn with_labels(mut self, x: &str, y: &str) -> Self {
        self.x.label = Some(x.into());
        self.y.label = Some(y.into());
        self
    }

    pub fn add_series(&mut self, series: Series) {
        self.series.push(series);
    }

    /// `(x_min, x_max, y_min, y_max)` over all series, padded so flat data still has a range.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let mut points = self.series.iter().flat_map(|s| s.points().iter());
        let first = points.next()?;
        let (mut x0, mut x1, mut y0, mut y1) = (first[0], first[0], first[1], first[1]);
        for p in points {
            x0 = x0.min(p[0]);
            x1 = x1.max(p[0]);
            y0 = y0.min(p[1]);
            y1 = y1.max(p[1]);
        }
        if x1 - x0 < f64::EPSILON {
            x1 = x0 + 1.0;
        }
        let pad = ((y1 - y0) * 0.1).max(1.0);
        Some((x0, x1, y0 - pad, y1 + pad))
    }
}

/// Keep roughly `max_points` evenly spaced points.
pub fn decimate_points(points: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points || max_points == 0 {
        return points.to_vec();
    }
    let bucket = points.len() as f64 / max_points as f64;
    (0..max_points)
        .map(|i| (i as f64 * bucket).floor() as usize)
        .take_while(|&idx| idx < points.len())
        .map(|idx| points[idx])
        .collect()
}

/// BPM readings against measured seconds, with the final value as a flat reference line.
pub fn figure_from_readings(readings: &[u32], interval_s: f64, final_bpm: Option<u32>) -> Figure {
    let mut fig = Figure::new(Some("Heart rate".to_string())).with_labels("measured time (s)", "BPM");
    let points: Vec<[f64; 2]> = readings
        .iter()
        .enumerate()
        .map(|(i, &bpm)| [(i + 1) as f64 * interval_s, bpm as f64])
        .collect();
    if let (Some(bpm), Some(first), Some(last)) = (final_bpm, points.first(), points.last()) {
        fig.add_series(Series::Line(LineSeries {
            name: "final".into(),
            points: vec![[first[0], bpm as f64], [last[0], bpm as f64]],
            style: Style {
                width: 1.0,
                color: Color(0x888888),
            },
        }));
    }
    fig.add_series(Series::Line(LineSeries {
        name: "readings".into(),
        points,
        style: Style {
            width: 2.0,
            color: Color(0xFF0077),
        },
    }));
    fig
}

/// Conditioned waveform with detected beats marked on it.
pub fn figure_from_conditioned(
    samples: &[ConditionedSample],
    peaks: &[PeakEvent],
    max_points: usize,
) -> Figure {
    let mut fig = Figure::new(Some("Conditioned pulse".to_string())).with_labels("time (s)", "intensity");
    let points: Vec<[f64; 2]> = samples.iter().map(|s| [s.timestamp, s.value]).collect();
    let value_at = |t: f64| {
        samples
            .iter()
            .min_by(|a, b| (a.timestamp - t).abs().total_cmp(&(b.timestamp - t).abs()))
            .map(|s| s.value)
            .unwrap_or(0.0)
    };
    fig.add_series(Series::Line(LineSeries {
        name: "pulse".into(),
        points: decimate_points(&points, max_points),
        style: Style {
            width: 1.4,
            color: Color(0x0077FF),
        },
    }));
    fig.add_series(Series::Points(LineSeries {
        name: "beats".into(),
        points: peaks.iter().map(|p| [p.timestamp, value_at(p.timestamp)]).collect(),
        style: Style {
            width: 3.0,
            color: Color(0xFF0077),
        },
    }));
    fig
}
