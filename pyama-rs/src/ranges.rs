//! Parse FOV selection strings like "all", "1,3", "0:10:2".
//! Slice semantics follow Python's `slice.indices`.

/// Expand a selection string to sorted, de-duplicated indices in `0..length`.
pub fn parse_selection(s: &str, length: usize) -> Result<Vec<usize>, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok((0..length).collect());
    }

    let len = length as isize;
    let mut picked = std::collections::BTreeSet::new();

    for segment in s.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if segment.contains(':') {
            let (start, stop, step) = parse_slice_segment(segment, len)?;
            let (mut idx, end, step) = clamp_slice(start, stop, step, len);
            while (step > 0 && idx < end) || (step < 0 && idx > end) {
                if idx >= 0 && idx < len {
                    picked.insert(idx as usize);
                }
                idx += step;
            }
        } else {
            let idx: isize = segment
                .parse()
                .map_err(|_| format!("invalid selection segment: {:?}", segment))?;
            if idx < -len || idx >= len {
                return Err(format!("index {} out of range for length {}", idx, length));
            }
            let idx = if idx < 0 { idx + len } else { idx };
            picked.insert(idx as usize);
        }
    }

    Ok(picked.into_iter().collect())
}

fn parse_slice_segment(segment: &str, len: isize) -> Result<(isize, isize, isize), String> {
    let parts: Vec<Option<isize>> = segment
        .split(':')
        .map(|p| {
            let t = p.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                t.parse()
                    .map(Some)
                    .map_err(|_| format!("invalid selection segment: {:?}", segment))
            }
        })
        .collect::<Result<_, _>>()?;
    if parts.len() > 3 {
        return Err(format!("invalid selection segment: {:?}", segment));
    }
    let step = parts.get(2).copied().flatten().unwrap_or(1);
    if step == 0 {
        return Err(format!("slice step cannot be zero: {:?}", segment));
    }
    let start = parts
        .first()
        .copied()
        .flatten()
        .unwrap_or(if step > 0 { 0 } else { len - 1 });
    let stop = parts
        .get(1)
        .copied()
        .flatten()
        .unwrap_or(if step > 0 { len } else { -len - 1 });
    Ok((start, stop, step))
}

/// Mirror Python `slice.indices(length)`.
fn clamp_slice(start: isize, stop: isize, step: isize, length: isize) -> (isize, isize, isize) {
    let norm = |v: isize, lo: isize| -> isize {
        let v = if v < 0 { v + length } else { v };
        v.clamp(lo, length)
    };
    if step > 0 {
        (norm(start, 0), norm(stop, 0), step)
    } else {
        let v = |v: isize| -> isize {
            let v = if v < 0 { v + length } else { v };
            v.clamp(-1, length - 1)
        };
        (v(start), v(stop), step)
    }
}
