use std::f64::consts::PI;
use std::fmt::Write as _;

use super::{ChartError, ChartKind, ChartSpec, Point};
use crate::warehouse::Row;

pub const SVG_MIME: &str = "image/svg+xml";

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 500.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_BOTTOM: f64 = 90.0;
const TICKS: usize = 5;
const DEFAULT_COLOR: &str = "#4c78a8";
const PALETTE: [&str; 8] = [
    "#4c78a8", "#f58518", "#e45756", "#72b7b2", "#54a24b", "#eeca3b", "#b279a2", "#ff9da6",
];

/// Render the spec over `rows` as a standalone SVG document.
pub fn render_svg(spec: &ChartSpec, rows: &[Row]) -> Result<String, ChartError> {
    let points = spec.points(rows)?;
    let mut svg = String::with_capacity(4096);
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif">"#
    );
    svg.push_str(r#"<rect width="100%" height="100%" fill="white"/>"#);
    let _ = write!(
        svg,
        r#"<text x="{}" y="32" text-anchor="middle" font-size="20">{}</text>"#,
        WIDTH / 2.0,
        escape(&spec.title)
    );

    let color = spec.color.as_deref().unwrap_or(DEFAULT_COLOR);
    match spec.kind {
        ChartKind::Pie => pie(&mut svg, &points)?,
        ChartKind::Bar => {
            let scale = YScale::new(&points, true);
            axes(&mut svg, spec, &scale);
            bars(&mut svg, &points, &scale, color);
        }
        ChartKind::Line => {
            let scale = YScale::new(&points, false);
            axes(&mut svg, spec, &scale);
            line(&mut svg, &points, &scale, color);
        }
        ChartKind::Scatter => {
            let scale = YScale::new(&points, false);
            axes(&mut svg, spec, &scale);
            scatter(&mut svg, &points, &scale, color);
        }
    }
    svg.push_str("</svg>");
    Ok(svg)
}

struct YScale {
    min: f64,
    max: f64,
}

impl YScale {
    fn new(points: &[Point], from_zero: bool) -> Self {
        let mut min = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let mut max = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        if from_zero {
            min = min.min(0.0);
            max = max.max(0.0);
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }
        Self { min, max }
    }

    fn y(&self, value: f64) -> f64 {
        let plot_h = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        HEIGHT - MARGIN_BOTTOM - (value - self.min) / (self.max - self.min) * plot_h
    }
}

fn plot_width() -> f64 {
    WIDTH - MARGIN_LEFT - MARGIN_RIGHT
}

/// Horizontal centre of slot `i` of `n`.
fn slot_x(i: usize, n: usize) -> f64 {
    MARGIN_LEFT + plot_width() * (i as f64 + 0.5) / n as f64
}

fn axes(svg: &mut String, spec: &ChartSpec, scale: &YScale) {
    let bottom = HEIGHT - MARGIN_BOTTOM;
    let right = WIDTH - MARGIN_RIGHT;
    let _ = write!(
        svg,
        r##"<line x1="{MARGIN_LEFT}" y1="{MARGIN_TOP}" x2="{MARGIN_LEFT}" y2="{bottom}" stroke="#333"/><line x1="{MARGIN_LEFT}" y1="{bottom}" x2="{right}" y2="{bottom}" stroke="#333"/>"##
    );
    for i in 0..=TICKS {
        let value = scale.min + (scale.max - scale.min) * i as f64 / TICKS as f64;
        let y = scale.y(value);
        let _ = write!(
            svg,
            r##"<line x1="{}" y1="{y:.1}" x2="{right}" y2="{y:.1}" stroke="#e0e0e0"/><text x="{}" y="{:.1}" text-anchor="end" font-size="11">{}</text>"##,
            MARGIN_LEFT,
            MARGIN_LEFT - 6.0,
            y + 4.0,
            tick_label(value)
        );
    }
    let x_label = spec.x_label.as_deref().unwrap_or(&spec.x);
    let y_label = spec.y_label.as_deref().unwrap_or(&spec.y);
    let _ = write!(
        svg,
        r#"<text x="{:.1}" y="{}" text-anchor="middle" font-size="13">{}</text>"#,
        MARGIN_LEFT + plot_width() / 2.0,
        HEIGHT - 12.0,
        escape(x_label)
    );
    let mid = MARGIN_TOP + (HEIGHT - MARGIN_TOP - MARGIN_BOTTOM) / 2.0;
    let _ = write!(
        svg,
        r#"<text x="18" y="{mid:.1}" text-anchor="middle" font-size="13" transform="rotate(-90 18 {mid:.1})">{}</text>"#,
        escape(y_label)
    );
}

fn category_labels(svg: &mut String, points: &[Point]) {
    let n = points.len();
    let rotate = n > 8;
    for (i, p) in points.iter().enumerate() {
        let x = slot_x(i, n);
        let y = HEIGHT - MARGIN_BOTTOM + 16.0;
        if rotate {
            let _ = write!(
                svg,
                r#"<text x="{x:.1}" y="{y:.1}" text-anchor="end" font-size="10" transform="rotate(-45 {x:.1} {y:.1})">{}</text>"#,
                escape(&truncate(&p.label, 18))
            );
        } else {
            let _ = write!(
                svg,
                r#"<text x="{x:.1}" y="{y:.1}" text-anchor="middle" font-size="11">{}</text>"#,
                escape(&truncate(&p.label, 18))
            );
        }
    }
}

fn bars(svg: &mut String, points: &[Point], scale: &YScale, color: &str) {
    let n = points.len();
    let slot = plot_width() / n as f64;
    let bar_w = (slot * 0.7).max(1.0);
    let zero = scale.y(0.0);
    for (i, p) in points.iter().enumerate() {
        let top = scale.y(p.y);
        let (y, h) = if top < zero { (top, zero - top) } else { (zero, top - zero) };
        let _ = write!(
            svg,
            r#"<rect x="{:.1}" y="{y:.1}" width="{bar_w:.1}" height="{h:.1}" fill="{color}"><title>{}: {}</title></rect>"#,
            slot_x(i, n) - bar_w / 2.0,
            escape(&p.label),
            tick_label(p.y)
        );
    }
    category_labels(svg, points);
}

fn line(svg: &mut String, points: &[Point], scale: &YScale, color: &str) {
    let n = points.len();
    let coords: Vec<String> = points
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{:.1},{:.1}", slot_x(i, n), scale.y(p.y)))
        .collect();
    let _ = write!(
        svg,
        r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2"/>"#,
        coords.join(" ")
    );
    for (i, p) in points.iter().enumerate() {
        let _ = write!(
            svg,
            r#"<circle cx="{:.1}" cy="{:.1}" r="3" fill="{color}"/>"#,
            slot_x(i, n),
            scale.y(p.y)
        );
    }
    category_labels(svg, points);
}

fn scatter(svg: &mut String, points: &[Point], scale: &YScale, color: &str) {
    let xs = points.iter().filter_map(|p| p.x);
    let (min, max) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
        (lo.min(x), hi.max(x))
    });
    let span = if (max - min).abs() < f64::EPSILON { 1.0 } else { max - min };
    for p in points {
        let x = MARGIN_LEFT + (p.x.unwrap_or(min) - min) / span * plot_width();
        let _ = write!(
            svg,
            r#"<circle cx="{x:.1}" cy="{:.1}" r="4" fill="{color}" fill-opacity="0.8"/>"#,
            scale.y(p.y)
        );
    }
    for i in 0..=TICKS {
        let value = min + span * i as f64 / TICKS as f64;
        let x = MARGIN_LEFT + plot_width() * i as f64 / TICKS as f64;
        let _ = write!(
            svg,
            r#"<text x="{x:.1}" y="{:.1}" text-anchor="middle" font-size="11">{}</text>"#,
            HEIGHT - MARGIN_BOTTOM + 16.0,
            tick_label(value)
        );
    }
}

fn pie(svg: &mut String, points: &[Point]) -> Result<(), ChartError> {
    let total: f64 = points.iter().map(|p| p.y).sum();
    if total <= 0.0 {
        return Err(ChartError::NoData("pie values sum to zero".into()));
    }
    let cx = WIDTH * 0.38;
    let cy = MARGIN_TOP + (HEIGHT - MARGIN_TOP) / 2.0 - 10.0;
    let r = 170.0;
    let mut angle = -PI / 2.0;
    for (i, p) in points.iter().enumerate() {
        let fill = PALETTE[i % PALETTE.len()];
        let share = p.y / total;
        if share >= 0.9999 {
            let _ = write!(svg, r#"<circle cx="{cx:.1}" cy="{cy:.1}" r="{r}" fill="{fill}"/>"#);
        } else if share > 0.0 {
            let end = angle + share * 2.0 * PI;
            let large = u8::from(share > 0.5);
            let _ = write!(
                svg,
                r#"<path d="M{cx:.1},{cy:.1} L{:.2},{:.2} A{r},{r} 0 {large} 1 {:.2},{:.2} Z" fill="{fill}" stroke="white"/>"#,
                cx + r * angle.cos(),
                cy + r * angle.sin(),
                cx + r * end.cos(),
                cy + r * end.sin()
            );
            angle = end;
        }
        let ly = MARGIN_TOP + 20.0 + i as f64 * 22.0;
        let lx = WIDTH * 0.68;
        let _ = write!(
            svg,
            r#"<rect x="{lx:.1}" y="{:.1}" width="14" height="14" fill="{fill}"/><text x="{:.1}" y="{ly:.1}" font-size="12">{} ({:.1}%)</text>"#,
            ly - 11.0,
            lx + 20.0,
            escape(&truncate(&p.label, 24)),
            share * 100.0
        );
    }
    Ok(())
}

fn tick_label(value: f64) -> String {
    if value.fract().abs() < 1e-9 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
