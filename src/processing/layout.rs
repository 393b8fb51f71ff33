/// Size of `src` scaled uniformly so it covers the whole frame.
///
/// Images that are relatively wider than the frame are scaled by height,
/// everything else by width, so one axis matches the frame exactly and the
/// other one overflows it.
pub fn cover_dimensions(src_w: u32, src_h: u32, frame_w: u32, frame_h: u32) -> (u32, u32) {
    let iw = src_w.max(1) as f64;
    let ih = src_h.max(1) as f64;
    let fw = frame_w.max(1) as f64;
    let fh = frame_h.max(1) as f64;
    if iw / ih > fw / fh {
        let scale = fh / ih;
        (((iw * scale).round() as u32).max(frame_w.max(1)), frame_h.max(1))
    } else {
        let scale = fw / iw;
        (frame_w.max(1), ((ih * scale).round() as u32).max(frame_h.max(1)))
    }
}

/// Largest size with the aspect ratio of `src` that fits inside the frame.
pub fn contain_dimensions(src_w: u32, src_h: u32, frame_w: u32, frame_h: u32) -> (u32, u32) {
    let iw = src_w.max(1) as f64;
    let ih = src_h.max(1) as f64;
    let scale = (frame_w.max(1) as f64 / iw).min(frame_h.max(1) as f64 / ih);
    let w = (iw * scale).round().clamp(1.0, frame_w.max(1) as f64);
    let h = (ih * scale).round().clamp(1.0, frame_h.max(1) as f64);
    (w as u32, h as u32)
}

pub fn center_offset(inner_w: u32, inner_h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    (
        outer_w.saturating_sub(inner_w) / 2,
        outer_h.saturating_sub(inner_h) / 2,
    )
}

/// Start of a `window`-long span along an axis of length `extent` that
/// keeps `start..end` in view.
///
/// The slack left over by the span is split evenly on both sides. Where that
/// would leave the axis, the window slides back inside so the slack moves to
/// the opposite side. A span wider than the window gets a centered window.
pub fn expand_window(start: u32, end: u32, window: u32, extent: u32) -> u32 {
    if window >= extent {
        return 0;
    }
    let span = end.saturating_sub(start) as i64;
    let slack = window as i64 - span;
    let lo = start as i64 - slack / 2;
    lo.clamp(0, (extent - window) as i64) as u32
}
