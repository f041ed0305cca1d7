//! Camera state to query bounds, and the rule deciding when cached bounds
//! no longer cover the view.

use serde::{Deserialize, Serialize};
use taxonium_protocol::{Bounds, XType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub target: [f64; 2],
    /// Log2 zoom per axis.
    pub zoom: [f64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeckSize {
    pub width: f64,
    pub height: f64,
}

/// The visible rectangle plus its size in layout units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub real_width: f64,
    pub real_height: f64,
    pub zoom: [f64; 2],
}

pub fn compute_bounds(view: &ViewState, deck: &DeckSize) -> ViewBounds {
    let real_width = deck.width / 2f64.powf(view.zoom[0]);
    let real_height = deck.height / 2f64.powf(view.zoom[1]);
    ViewBounds {
        min_x: view.target[0] - real_width / 2.0,
        max_x: view.target[0] + real_width / 2.0,
        min_y: view.target[1] - real_height / 2.0,
        max_y: view.target[1] + real_height / 2.0,
        real_width,
        real_height,
        zoom: view.zoom,
    }
}

/// True when a fresh query is needed: nothing cached, any cached side unset,
/// a different axis, the view reaching within half a screen of a cached
/// edge, or a vertical zoom change of more than half a level.
pub fn needs_refresh(view: &ViewBounds, cached: Option<&Bounds>, x_type: XType) -> bool {
    let Some(cached) = cached else {
        return true;
    };
    if cached.x_type != x_type {
        return true;
    }
    let (Some(min_x), Some(max_x), Some(min_y), Some(max_y)) = (
        Bounds::component(cached.min_x),
        Bounds::component(cached.max_x),
        Bounds::component(cached.min_y),
        Bounds::component(cached.max_y),
    ) else {
        return true;
    };
    view.min_x < min_x + view.real_width / 2.0
        || view.max_x > max_x - view.real_width / 2.0
        || view.min_y < min_y + view.real_height / 2.0
        || view.max_y > max_y - view.real_height / 2.0
        || (view.zoom[1] - cached.zoom[1]).abs() > 0.5
}

/// Query bounds padded by one screen on every side.
pub fn widen(view: &ViewBounds, x_type: XType) -> Bounds {
    Bounds {
        min_x: Some(view.min_x - view.real_width),
        max_x: Some(view.max_x + view.real_width),
        min_y: Some(view.min_y - view.real_height),
        max_y: Some(view.max_y + view.real_height),
        zoom: view.zoom,
        x_type,
    }
}

/// True when the visible rectangle has moved outside the bounds that
/// produced the data on screen.
pub fn is_outside(view: &ViewBounds, last: Option<&Bounds>) -> bool {
    let Some(last) = last else {
        return false;
    };
    let outside = |value: f64, edge: Option<f64>, below: bool| {
        Bounds::component(edge).is_some_and(|edge| if below { value < edge } else { value > edge })
    };
    outside(view.min_x, last.min_x, true)
        || outside(view.max_x, last.max_x, false)
        || outside(view.min_y, last.min_y, true)
        || outside(view.max_y, last.max_y, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ViewBounds {
        compute_bounds(
            &ViewState {
                target: [100.0, 500.0],
                zoom: [0.0, 1.0],
            },
            &DeckSize {
                width: 200.0,
                height: 400.0,
            },
        )
    }

    #[test]
    fn test_compute_bounds() {
        let v = view();
        assert_eq!(v.real_width, 200.0);
        assert_eq!(v.real_height, 200.0);
        assert_eq!((v.min_x, v.max_x), (0.0, 200.0));
        assert_eq!((v.min_y, v.max_y), (400.0, 600.0));
    }

    #[test]
    fn test_widened_bounds_cover_small_pans() {
        let v = view();
        let cached = widen(&v, XType::Distance);
        assert_eq!(cached.min_x, Some(-200.0));
        assert!(!needs_refresh(&v, Some(&cached), XType::Distance));

        let mut panned = v;
        panned.min_x += 50.0;
        panned.max_x += 50.0;
        assert!(!needs_refresh(&panned, Some(&cached), XType::Distance));
        panned.min_x += 200.0;
        panned.max_x += 200.0;
        assert!(needs_refresh(&panned, Some(&cached), XType::Distance));
    }

    #[test]
    fn test_unset_or_changed_bounds_refresh() {
        let v = view();
        let mut cached = widen(&v, XType::Distance);
        assert!(needs_refresh(&v, None, XType::Distance));
        assert!(needs_refresh(&v, Some(&cached), XType::Time));
        let mut zoomed = v;
        zoomed.zoom[1] = 2.0;
        assert!(needs_refresh(&zoomed, Some(&cached), XType::Distance));
        cached.min_y = Some(f64::NAN);
        assert!(needs_refresh(&v, Some(&cached), XType::Distance));
    }

    #[test]
    fn test_is_outside_handles_zero_edges() {
        let v = ViewBounds {
            min_x: 0.0,
            max_x: 5.0,
            min_y: 0.0,
            max_y: 5.0,
            real_width: 5.0,
            real_height: 5.0,
            zoom: [0.0, 0.0],
        };
        let last = Bounds {
            min_x: Some(10.0),
            max_x: Some(20.0),
            min_y: Some(-10.0),
            max_y: Some(20.0),
            ..Default::default()
        };
        assert!(is_outside(&v, Some(&last)));
        assert!(!is_outside(&v, None));
    }
}
