//! Minimal raster charts for the EDA report
//!
//! Charts are drawn straight into an `RgbImage`: a light background, a plot
//! area with labelled axes and the data marks. Labels use a built-in 3x5
//! bitmap font that covers digits, Latin capitals and a few symbols; the
//! exact numbers behind every chart are also in the summary file.

use image::{Rgb, RgbImage};
use std::f64::consts::TAU;

const BACKGROUND: Rgb<u8> = Rgb([245, 245, 245]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const GRID: Rgb<u8> = Rgb([220, 220, 220]);
const MARGIN: u32 = 64;
const TEXT_SCALE: u32 = 2;

pub const SKY_BLUE: Rgb<u8> = Rgb([135, 206, 235]);
pub const SALMON: Rgb<u8> = Rgb([250, 128, 114]);
pub const STEEL: Rgb<u8> = Rgb([70, 130, 180]);

const PALETTE: [Rgb<u8>; 8] = [
    Rgb([31, 119, 180]),
    Rgb([255, 127, 14]),
    Rgb([44, 160, 44]),
    Rgb([214, 39, 40]),
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
    Rgb([227, 119, 194]),
    Rgb([127, 127, 127]),
];

/// Axis titles for [`histogram`] and [`scatter`]
#[derive(Debug, Clone, Copy)]
pub struct AxisLabels<'a> {
    pub x: &'a str,
    pub y: &'a str,
}

/// Equal-width bin counts over `[min, max]`
pub fn histogram_counts(values: &[f64], bins: usize) -> Vec<usize> {
    let mut counts = vec![0usize; bins.max(1)];
    if values.is_empty() {
        return counts;
    }
    let (min, max) = bounds(values);
    let span = (max - min).max(f64::EPSILON);
    let last = counts.len() - 1;
    for &v in values {
        let idx = (((v - min) / span) * counts.len() as f64) as usize;
        counts[idx.min(last)] += 1;
    }
    counts
}

/// Histogram of `values` with `bins` bars; the x axis spans the value range
pub fn histogram(
    values: &[f64],
    bins: usize,
    color: Rgb<u8>,
    labels: AxisLabels<'_>,
    width: u32,
    height: u32,
) -> RgbImage {
    let counts = histogram_counts(values, bins);
    let mut img = canvas(width, height);
    let area = plot_area(width, height);
    let peak = counts.iter().copied().max().unwrap_or(0).max(1);
    draw_bars(&mut img, &counts, peak, color, area);

    let (lo, hi) = if values.is_empty() { (0.0, 1.0) } else { bounds(values) };
    draw_axes(&mut img, area, labels, (lo, hi), (0.0, peak as f64));
    img
}

/// Scatter plot of `points`, both axes starting at zero
pub fn scatter(points: &[(f64, f64)], color: Rgb<u8>, labels: AxisLabels<'_>, width: u32, height: u32) -> RgbImage {
    let mut img = canvas(width, height);
    let area = plot_area(width, height);
    let (x0, y0, x1, y1) = area;
    let max_x = points.iter().map(|p| p.0).fold(1.0, f64::max);
    let max_y = points.iter().map(|p| p.1).fold(1.0, f64::max);

    for &(x, y) in points {
        let px = x0 + ((x / max_x) * (x1 - x0) as f64) as u32;
        let py = y1 - ((y / max_y) * (y1 - y0) as f64) as u32;
        fill_rect(
            &mut img,
            px.saturating_sub(2),
            py.saturating_sub(2),
            (px + 2).min(x1),
            (py + 2).min(y1),
            color,
        );
    }
    draw_axes(&mut img, area, labels, (0.0, max_x), (0.0, max_y));
    img
}

/// Pie of `slices`, clockwise from twelve o'clock, with a legend giving
/// every label and its share
pub fn pie_chart(slices: &[(String, usize)], width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);
    let total: usize = slices.iter().map(|s| s.1).sum();
    if total == 0 {
        return img;
    }

    let pad = 20u32.min(width / 8).min(height / 8);
    let radius = (height.min(width * 3 / 5) / 2).saturating_sub(pad).max(1);
    let (cx, cy) = ((pad + radius) as f64, (height / 2) as f64);
    let r = radius as f64;

    let mut ends = Vec::with_capacity(slices.len());
    let mut acc = 0.0;
    for (_, count) in slices {
        acc += *count as f64 / total as f64;
        ends.push(acc);
    }

    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let mut angle = dx.atan2(-dy);
            if angle < 0.0 {
                angle += TAU;
            }
            let fraction = angle / TAU;
            let idx = ends.iter().position(|&end| fraction < end).unwrap_or(slices.len() - 1);
            img.put_pixel(x, y, PALETTE[idx % PALETTE.len()]);
        }
    }

    let glyph_h = 5 * TEXT_SCALE;
    let legend_x = pad + 2 * radius + 2 * pad;
    let mut legend_y = pad;
    for (i, (label, count)) in slices.iter().enumerate() {
        let share = 100.0 * *count as f64 / total as f64;
        fill_rect(&mut img, legend_x, legend_y, legend_x + 2 * glyph_h, legend_y + glyph_h, PALETTE[i % PALETTE.len()]);
        draw_text(
            &mut img,
            legend_x + 3 * glyph_h,
            legend_y,
            &format!("{label} {share:.1}%"),
            TEXT_SCALE,
            AXIS,
        );
        legend_y += 3 * glyph_h;
    }
    img
}

fn draw_bars(img: &mut RgbImage, counts: &[usize], peak: usize, color: Rgb<u8>, (x0, y0, x1, y1): (u32, u32, u32, u32)) {
    let slot = (x1 - x0) as f64 / counts.len().max(1) as f64;
    for (i, &count) in counts.iter().enumerate() {
        let left = x0 + (i as f64 * slot) as u32;
        let right = (x0 + ((i + 1) as f64 * slot) as u32).saturating_sub(1).max(left);
        let bar = ((count as f64 / peak as f64) * (y1 - y0) as f64) as u32;
        fill_rect(img, left, y1.saturating_sub(bar), right, y1, color);
        if right > left {
            draw_vline(img, right, y1.saturating_sub(bar), y1, AXIS);
        }
    }
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn canvas(width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);
    let (x0, y0, x1, y1) = plot_area(width, height);
    for step in 1..4 {
        let y = y0 + (y1 - y0) * step / 4;
        for x in x0..=x1 {
            img.put_pixel(x, y, GRID);
        }
    }
    img
}

fn plot_area(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let margin = MARGIN.min(width / 4).min(height / 4);
    (margin, margin, width - margin - 1, height - margin - 1)
}

/// Axis lines, min/mid/max ticks on both axes, and the axis titles
fn draw_axes(
    img: &mut RgbImage,
    (x0, y0, x1, y1): (u32, u32, u32, u32),
    labels: AxisLabels<'_>,
    x_range: (f64, f64),
    y_range: (f64, f64),
) {
    for x in x0..=x1 {
        img.put_pixel(x, y1, AXIS);
    }
    draw_vline(img, x0, y0, y1, AXIS);

    let glyph_h = 5 * TEXT_SCALE;
    let tick = 4;
    for step in 0..=2u32 {
        let x = x0 + (x1 - x0) * step / 2;
        draw_vline(img, x, y1, (y1 + tick).min(img.height() - 1), AXIS);
        let text = tick_label(x_range.0 + (x_range.1 - x_range.0) * step as f64 / 2.0);
        let w = text_width(&text, TEXT_SCALE);
        let left = match step {
            0 => x,
            1 => x.saturating_sub(w / 2),
            _ => x.saturating_sub(w),
        };
        draw_text(img, left, y1 + tick + 2, &text, TEXT_SCALE, AXIS);

        let y = y1 - (y1 - y0) * step / 2;
        for tx in x0.saturating_sub(tick)..x0 {
            img.put_pixel(tx, y, AXIS);
        }
        let text = tick_label(y_range.0 + (y_range.1 - y_range.0) * step as f64 / 2.0);
        let w = text_width(&text, TEXT_SCALE);
        draw_text(
            img,
            x0.saturating_sub(tick + 2 + w),
            y.saturating_sub(glyph_h / 2),
            &text,
            TEXT_SCALE,
            AXIS,
        );
    }

    let x_title_w = text_width(labels.x, TEXT_SCALE);
    let mid = x0 + (x1 - x0) / 2;
    draw_text(
        img,
        mid.saturating_sub(x_title_w / 2),
        y1 + tick + 2 + 2 * glyph_h,
        labels.x,
        TEXT_SCALE,
        AXIS,
    );
    draw_text(img, x0, y0.saturating_sub(2 * glyph_h), labels.y, TEXT_SCALE, AXIS);
}

fn tick_label(value: f64) -> String {
    if value.abs() >= 10.0 || value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn draw_vline(img: &mut RgbImage, x: u32, y0: u32, y1: u32, color: Rgb<u8>) {
    for y in y0..=y1 {
        img.put_pixel(x, y, color);
    }
}

fn fill_rect(img: &mut RgbImage, left: u32, top: u32, right: u32, bottom: u32, color: Rgb<u8>) {
    for y in top..=bottom.min(img.height() - 1) {
        for x in left..=right.min(img.width() - 1) {
            img.put_pixel(x, y, color);
        }
    }
}

fn text_width(text: &str, scale: u32) -> u32 {
    (text.chars().count() as u32 * 4 * scale).saturating_sub(scale)
}

/// Draw `text` with its top-left corner at `(x, y)`. Lowercase letters are
/// drawn as capitals, unknown characters as blanks, and pixels outside the
/// image are dropped.
fn draw_text(img: &mut RgbImage, x: u32, y: u32, text: &str, scale: u32, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    for (i, ch) in text.chars().enumerate() {
        let Some(rows) = glyph(ch.to_ascii_uppercase()) else {
            continue;
        };
        let left = x + i as u32 * 4 * scale;
        for (row, bits) in rows.iter().enumerate() {
            for (col, cell) in bits.bytes().enumerate() {
                if cell != b'#' {
                    continue;
                }
                let px = left + col as u32 * scale;
                let py = y + row as u32 * scale;
                for sy in py..(py + scale).min(h) {
                    for sx in px..(px + scale).min(w) {
                        img.put_pixel(sx, sy, color);
                    }
                }
            }
        }
    }
}

fn glyph(ch: char) -> Option<[&'static str; 5]> {
    let rows = match ch {
        '0' => ["###", "#.#", "#.#", "#.#", "###"],
        '1' => [".#.", "##.", ".#.", ".#.", "###"],
        '2' => ["###", "..#", "###", "#..", "###"],
        '3' => ["###", "..#", "###", "..#", "###"],
        '4' => ["#.#", "#.#", "###", "..#", "..#"],
        '5' => ["###", "#..", "###", "..#", "###"],
        '6' => ["###", "#..", "###", "#.#", "###"],
        '7' => ["###", "..#", "..#", "..#", "..#"],
        '8' => ["###", "#.#", "###", "#.#", "###"],
        '9' => ["###", "#.#", "###", "..#", "###"],
        'A' => [".#.", "#.#", "###", "#.#", "#.#"],
        'B' => ["##.", "#.#", "##.", "#.#", "##."],
        'C' => ["###", "#..", "#..", "#..", "###"],
        'D' => ["##.", "#.#", "#.#", "#.#", "##."],
        'E' => ["###", "#..", "##.", "#..", "###"],
        'F' => ["###", "#..", "##.", "#..", "#.."],
        'G' => ["###", "#..", "#.#", "#.#", "###"],
        'H' => ["#.#", "#.#", "###", "#.#", "#.#"],
        'I' => ["###", ".#.", ".#.", ".#.", "###"],
        'J' => ["..#", "..#", "..#", "#.#", "###"],
        'K' => ["#.#", "#.#", "##.", "#.#", "#.#"],
        'L' => ["#..", "#..", "#..", "#..", "###"],
        'M' => ["#.#", "###", "###", "#.#", "#.#"],
        'N' => ["##.", "#.#", "#.#", "#.#", "#.#"],
        'O' => [".#.", "#.#", "#.#", "#.#", ".#."],
        'P' => ["###", "#.#", "###", "#..", "#.."],
        'Q' => ["###", "#.#", "#.#", "###", "..#"],
        'R' => ["###", "#.#", "##.", "#.#", "#.#"],
        'S' => ["###", "#..", "###", "..#", "###"],
        'T' => ["###", ".#.", ".#.", ".#.", ".#."],
        'U' => ["#.#", "#.#", "#.#", "#.#", "###"],
        'V' => ["#.#", "#.#", "#.#", "#.#", ".#."],
        'W' => ["#.#", "#.#", "###", "###", "#.#"],
        'X' => ["#.#", "#.#", ".#.", "#.#", "#.#"],
        'Y' => ["#.#", "#.#", ".#.", ".#.", ".#."],
        'Z' => ["###", "..#", ".#.", "#..", "###"],
        '.' => ["...", "...", "...", "...", ".#."],
        '%' => ["#.#", "..#", ".#.", "#..", "#.#"],
        '-' => ["...", "...", "###", "...", "..."],
        '/' => ["..#", "..#", ".#.", "#..", "#.."],
        '(' => [".#.", "#..", "#..", "#..", ".#."],
        ')' => [".#.", "..#", "..#", "..#", ".#."],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: AxisLabels<'static> = AxisLabels {
        x: "Width (px)",
        y: "Count",
    };

    fn axis_pixels(img: &RgbImage, x_range: std::ops::Range<u32>, y_range: std::ops::Range<u32>) -> usize {
        let mut n = 0;
        for y in y_range {
            for x in x_range.clone() {
                if *img.get_pixel(x, y) == AXIS {
                    n += 1;
                }
            }
        }
        n
    }

    #[test]
    fn test_histogram_counts_cover_every_value() {
        let values = [1.0, 2.0, 2.5, 3.0, 10.0];
        let counts = histogram_counts(&values, 3);
        assert_eq!(counts.iter().sum::<usize>(), values.len());
        assert_eq!(counts[2], 1);
    }

    #[test]
    fn test_constant_values_land_in_first_bin() {
        let counts = histogram_counts(&[5.0; 4], 10);
        assert_eq!(counts[0], 4);
    }

    #[test]
    fn test_charts_have_requested_size() {
        let img = histogram(&[1.0, 2.0, 3.0], 50, SKY_BLUE, LABELS, 600, 300);
        assert_eq!(img.dimensions(), (600, 300));
        let img = scatter(&[(100.0, 50.0), (0.0, 0.0)], STEEL, LABELS, 400, 400);
        assert_eq!(img.dimensions(), (400, 400));
        assert!(img.pixels().any(|p| *p == STEEL));
        let img = pie_chart(&[("jpg".to_string(), 1)], 500, 300);
        assert_eq!(img.dimensions(), (500, 300));
    }

    #[test]
    fn test_glyphs_are_drawn_cell_by_cell() {
        let mut img = RgbImage::from_pixel(20, 10, BACKGROUND);
        draw_text(&mut img, 0, 0, "1", 1, AXIS);
        assert_eq!(axis_pixels(&img, 0..20, 0..10), 8);

        let mut scaled = RgbImage::from_pixel(20, 20, BACKGROUND);
        draw_text(&mut scaled, 0, 0, "1", 2, AXIS);
        assert_eq!(axis_pixels(&scaled, 0..20, 0..20), 32);

        // lowercase maps to capitals, unknown characters are skipped
        let mut lower = RgbImage::from_pixel(20, 10, BACKGROUND);
        draw_text(&mut lower, 0, 0, "l?", 1, AXIS);
        assert_eq!(axis_pixels(&lower, 0..20, 0..10), 7);
    }

    #[test]
    fn test_text_clips_at_the_image_edge() {
        let mut img = RgbImage::from_pixel(6, 3, BACKGROUND);
        draw_text(&mut img, 4, 1, "8888", 1, AXIS);
        // rows "###" and "#.#" of the first glyph, two columns each
        assert_eq!(axis_pixels(&img, 0..6, 0..3), 3);
    }

    #[test]
    fn test_axes_carry_tick_and_title_labels() {
        let (w, h) = (600, 300);
        let img = histogram(&[100.0, 250.0, 400.0], 10, SKY_BLUE, LABELS, w, h);
        let (x0, y0, _, y1) = plot_area(w, h);
        // tick values and the x title below the axis
        assert!(axis_pixels(&img, 0..w, y1 + 6..h) > 0);
        // y tick values left of the axis
        assert!(axis_pixels(&img, 0..x0 - 4, y0..y1) > 0);
        // y title above the plot area
        assert!(axis_pixels(&img, x0..w, 0..y0) > 0);
    }

    #[test]
    fn test_tick_labels_are_short() {
        assert_eq!(tick_label(1024.0), "1024");
        assert_eq!(tick_label(512.4), "512");
        assert_eq!(tick_label(0.0), "0");
        assert_eq!(tick_label(0.5), "0.50");
    }

    #[test]
    fn test_pie_slices_follow_their_shares() {
        let (w, h) = (500, 300);
        let slices = vec![("jpg".to_string(), 3), ("png".to_string(), 1)];
        let img = pie_chart(&slices, w, h);

        let pad = 20;
        let radius = h.min(w * 3 / 5) / 2 - pad;
        let (cx, cy) = (pad + radius, h / 2);
        let half = radius / 2;
        // upper right lies in the first three quarters
        assert_eq!(*img.get_pixel(cx + half, cy - half), PALETTE[0]);
        assert_eq!(*img.get_pixel(cx + half, cy + half), PALETTE[0]);
        // upper left is the last quarter
        assert_eq!(*img.get_pixel(cx - half, cy - half / 2), PALETTE[1]);
        // legend swatches
        let legend_x = pad + 2 * radius + 2 * pad;
        assert_eq!(*img.get_pixel(legend_x + 1, pad + 1), PALETTE[0]);
        assert_eq!(*img.get_pixel(legend_x + 1, pad + 30 + 1), PALETTE[1]);
    }

    #[test]
    fn test_empty_pie_is_blank() {
        let img = pie_chart(&[], 100, 100);
        assert!(img.pixels().all(|p| *p == BACKGROUND));
    }
}
