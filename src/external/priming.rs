use std::sync::Mutex;

use crate::{
    engine::distribution::Distribution,
    error::VeldResult,
    external::{DataRequest, ExternalLayer},
    geom::{ConvexHull, Geometry},
};

/// Decorator that injects a priming extent into outgoing requests.
///
/// The *static* flavor fixes the extent at construction; the *extending*
/// flavor folds every requested geometry into a running convex hull first.
/// Downstream, the cache layer keys on the injected extent, so a stable
/// hull turns many point requests into one warm read.
pub struct PrimingLayer<L> {
    inner: L,
    hull: Mutex<ConvexHull>,
    extending: bool,
}

impl<L: ExternalLayer> PrimingLayer<L> {
    /// Fixed priming extent.
    pub fn fixed(inner: L, extent: &Geometry) -> Self {
        Self {
            inner,
            hull: Mutex::new(ConvexHull::of(extent.hull_points())),
            extending: false,
        }
    }

    /// Extent that grows with each requested geometry.
    pub fn extending(inner: L) -> Self {
        Self {
            inner,
            hull: Mutex::new(ConvexHull::new()),
            extending: true,
        }
    }

    /// The current priming extent, if any geometry has been absorbed.
    pub fn extent(&self) -> Option<Geometry> {
        self.hull
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .geometry()
    }
}

impl<L: ExternalLayer> ExternalLayer for PrimingLayer<L> {
    fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
        let extent = {
            let mut hull = self.hull.lock().unwrap_or_else(|poison| poison.into_inner());
            if self.extending {
                hull.extend(request.geometry.hull_points());
            }
            hull.geometry()
        };

        match extent {
            Some(geometry) => {
                let primed = request.clone().with_priming(geometry);
                self.inner.fulfill(&primed)
            }
            None => self.inner.fulfill(request),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::units::Units;
    use std::sync::Mutex as StdMutex;

    /// Records the priming geometry seen by the base layer.
    #[derive(Default)]
    struct Probe {
        seen: StdMutex<Vec<Option<Geometry>>>,
    }

    impl ExternalLayer for Probe {
        fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
            self.seen
                .lock()
                .unwrap()
                .push(request.priming.clone());
            Ok(Distribution::realized_f64([0.0], Units::empty()))
        }
    }

    fn point_request(lat: f64, lon: f64) -> DataRequest {
        DataRequest::new("f.jshd", "temp", 0, Geometry::Point { lat, lon })
    }

    #[test]
    fn test_fixed_extent_is_injected_unchanged() {
        let extent = Geometry::rect(0.0, 0.0, 10.0, 10.0);
        let layer = PrimingLayer::fixed(Probe::default(), &extent);

        layer.fulfill(&point_request(50.0, 50.0)).unwrap();
        layer.fulfill(&point_request(60.0, 60.0)).unwrap();

        let seen = layer.inner.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1], "static extent never moves");
        assert!(seen[0].is_some());
    }

    #[test]
    fn test_extending_hull_grows_with_requests() {
        let layer = PrimingLayer::extending(Probe::default());

        layer.fulfill(&point_request(0.0, 0.0)).unwrap();
        layer.fulfill(&point_request(10.0, 10.0)).unwrap();
        layer.fulfill(&point_request(0.0, 10.0)).unwrap();

        let extent = layer.extent().expect("hull after three points");
        assert!(extent.contains(5.0, 5.0), "hull covers the interior");
    }
}
