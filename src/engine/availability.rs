use crate::model::Span;

// ── Free-window computation ───────────────────────────────────────

/// Subtract a sorted, disjoint blocked set from a query window, yielding the
/// free windows within it, ascending by start.
pub fn free_spans(blocked: &[Span], window: &Span) -> Vec<Span> {
    let mut result = Vec::new();
    let mut cursor = window.start;

    for b in blocked {
        if b.end <= cursor {
            continue;
        }
        if b.start >= window.end {
            break;
        }
        if b.start > cursor {
            result.push(Span::new(cursor, b.start.min(window.end)));
        }
        cursor = cursor.max(b.end);
        if cursor >= window.end {
            return result;
        }
    }

    if cursor < window.end {
        result.push(Span::new(cursor, window.end));
    }
    result
}

/// True iff `spans` (sorted by start) are pairwise non-overlapping.
/// Invariant checker: every vehicle's blocked set must satisfy this after
/// any sequence of approvals.
pub fn is_disjoint(spans: &[Span]) -> bool {
    spans.windows(2).all(|w| w[0].end <= w[1].start)
}
