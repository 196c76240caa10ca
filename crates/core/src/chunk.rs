use nalgebra::Vector3;

/// Per-record sensor origins, stored as separate component vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Origins {
    pub ox: Vec<f64>,
    pub oy: Vec<f64>,
    pub oz: Vec<f64>,
}

/// Per-record RGBA colors. The alpha channel doubles as a normalized
/// intensity by convention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Colors {
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
    pub a: Vec<u8>,
}

/// Per-record surface normals. The all-zero row is the sentinel for an
/// unreliable estimate (cloud boundary, sparse neighborhood) and must be
/// checked by consumers before use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normals {
    pub nx: Vec<f64>,
    pub ny: Vec<f64>,
    pub nz: Vec<f64>,
}

impl Normals {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            nx: Vec::with_capacity(n),
            ny: Vec::with_capacity(n),
            nz: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.nx.len(), self.ny.len());
        debug_assert_eq!(self.nx.len(), self.nz.len());
        self.nx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nx.is_empty()
    }

    pub fn push(&mut self, n: Vector3<f64>) {
        self.nx.push(n.x);
        self.ny.push(n.y);
        self.nz.push(n.z);
    }

    /// Push the all-zero "unreliable" sentinel.
    pub fn push_sentinel(&mut self) {
        self.push(Vector3::zeros());
    }

    pub fn vector(&self, i: usize) -> Vector3<f64> {
        Vector3::new(self.nx[i], self.ny[i], self.nz[i])
    }

    /// True when row `i` holds the zero-length sentinel.
    pub fn is_unreliable(&self, i: usize) -> bool {
        self.nx[i] == 0.0 && self.ny[i] == 0.0 && self.nz[i] == 0.0
    }
}

/// The four-component positional-variance decomposition plus its sum.
///
/// `total[i]` is always exactly `range[i] + angular[i] + aoi[i] + mixed[i]`;
/// the vectors are filled together and never patched individually.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variances {
    pub range: Vec<f64>,
    pub angular: Vec<f64>,
    pub aoi: Vec<f64>,
    pub mixed: Vec<f64>,
    pub total: Vec<f64>,
}

impl Variances {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            range: Vec::with_capacity(n),
            angular: Vec::with_capacity(n),
            aoi: Vec::with_capacity(n),
            mixed: Vec::with_capacity(n),
            total: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn push(&mut self, range: f64, angular: f64, aoi: f64, mixed: f64) {
        self.range.push(range);
        self.angular.push(angular);
        self.aoi.push(aoi);
        self.mixed.push(mixed);
        self.total.push(range + angular + aoi + mixed);
    }
}

/// One bounded batch of cloud records in structure-of-arrays form.
///
/// `x`/`y`/`z` hold the return points (ray ends). `origins` is present for
/// ray clouds and absent for plain point clouds. `normals` and `variances`
/// are optional blocks populated by the processing passes. All populated
/// arrays must have equal length; mismatches are programmer errors.
///
/// Chunks are transient: a reader produces them one at a time and consumers
/// do not accumulate them, which is what bounds peak memory to one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudChunk {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub origins: Option<Origins>,
    pub times: Vec<f64>,
    pub colors: Option<Colors>,
    pub normals: Option<Normals>,
    pub variances: Option<Variances>,
}

impl CloudChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            z: Vec::with_capacity(n),
            origins: None,
            times: Vec::with_capacity(n),
            colors: None,
            normals: None,
            variances: None,
        }
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.x.len(), self.y.len());
        debug_assert_eq!(self.x.len(), self.z.len());
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Append one ray record (end point, sensor origin, timestamp, color).
    pub fn push_ray(&mut self, start: Vector3<f64>, end: Vector3<f64>, time: f64, color: [u8; 4]) {
        self.x.push(end.x);
        self.y.push(end.y);
        self.z.push(end.z);
        let origins = self.origins.get_or_insert_with(Origins::default);
        origins.ox.push(start.x);
        origins.oy.push(start.y);
        origins.oz.push(start.z);
        self.times.push(time);
        let colors = self.colors.get_or_insert_with(Colors::default);
        colors.r.push(color[0]);
        colors.g.push(color[1]);
        colors.b.push(color[2]);
        colors.a.push(color[3]);
    }

    /// Append one point record (no sensor origin).
    pub fn push_point(&mut self, pos: Vector3<f64>, time: f64, color: [u8; 4]) {
        self.x.push(pos.x);
        self.y.push(pos.y);
        self.z.push(pos.z);
        self.times.push(time);
        let colors = self.colors.get_or_insert_with(Colors::default);
        colors.r.push(color[0]);
        colors.g.push(color[1]);
        colors.b.push(color[2]);
        colors.a.push(color[3]);
    }

    /// Return point `i`.
    pub fn point(&self, i: usize) -> Vector3<f64> {
        Vector3::new(self.x[i], self.y[i], self.z[i])
    }

    /// Sensor origin of record `i`.
    ///
    /// # Panics
    ///
    /// Panics if the chunk carries no origins; call [`ensure_origins`]
    /// first when the input may be a plain point cloud.
    ///
    /// [`ensure_origins`]: CloudChunk::ensure_origins
    pub fn origin(&self, i: usize) -> Vector3<f64> {
        let o = self
            .origins
            .as_ref()
            .expect("chunk carries no ray origins");
        Vector3::new(o.ox[i], o.oy[i], o.oz[i])
    }

    pub fn has_origins(&self) -> bool {
        self.origins.is_some()
    }

    /// Fill in all-zero sensor origins when absent, so downstream passes can
    /// treat every input as a ray cloud.
    pub fn ensure_origins(&mut self) {
        if self.origins.is_none() {
            let n = self.len();
            self.origins = Some(Origins {
                ox: vec![0.0; n],
                oy: vec![0.0; n],
                oz: vec![0.0; n],
            });
        }
    }

    /// Normal of record `i`, or `None` when the chunk has no normals block.
    /// The zero-length sentinel is returned as-is; check
    /// [`Normals::is_unreliable`] before trusting it.
    pub fn normal(&self, i: usize) -> Option<Vector3<f64>> {
        self.normals.as_ref().map(|n| n.vector(i))
    }

    /// Normalized intensity of record `i` from the color alpha channel,
    /// or `None` when the chunk carries no colors.
    pub fn intensity(&self, i: usize) -> Option<f64> {
        self.colors.as_ref().map(|c| f64::from(c.a[i]) / 255.0)
    }

    /// Return points as a contiguous array, for feeding a neighbor index.
    pub fn points_array(&self) -> Vec<[f64; 3]> {
        (0..self.len())
            .map(|i| [self.x[i], self.y[i], self.z[i]])
            .collect()
    }
}
