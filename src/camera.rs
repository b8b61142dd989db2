//! Pinhole camera with radial-tangential distortion and world-to-camera poses.

use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Quaternion, Rad, Vector3};

/// Index of a pose in [CameraData::extrinsics].
pub type PoseHandle = usize;

/// Convert Rodrigues vector to a rotation.
pub fn from_rodrigues(x: Vector3<f64>) -> Matrix3<f64> {
    let theta2 = x.dot(x);
    if theta2 > 1e-24 {
        Matrix3::from_axis_angle(x.normalize(), Rad(theta2.sqrt()))
    } else {
        // first order approximation, exact to machine precision this close to identity
        Matrix3::new(1.0, x[2], -x[1], -x[2], 1.0, x[0], x[1], -x[0], 1.0)
    }
}

/// Convert rotation to Rodrigues vector.
pub fn to_rodrigues(r: Matrix3<f64>) -> Vector3<f64> {
    let mut q = Quaternion::from(r);
    if q.s < 0.0 {
        q = -q;
    }
    let sin_half = q.v.magnitude();
    if sin_half < 1e-12 {
        return q.v * 2.0;
    }
    let angle = 2.0 * sin_half.atan2(q.s);
    q.v * (angle / sin_half)
}

/// Cross product matrix `[v]x`.
pub fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, v.z, -v.y, -v.z, 0.0, v.x, v.y, -v.x, 0.0)
}

pub(crate) fn to_na(m: &Matrix3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(
        m.x.x, m.y.x, m.z.x, //
        m.x.y, m.y.y, m.z.y, //
        m.x.z, m.y.z, m.z.z,
    )
}

pub(crate) fn from_na(m: &na::Matrix3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        m[(0, 0)],
        m[(1, 0)],
        m[(2, 0)],
        m[(0, 1)],
        m[(1, 1)],
        m[(2, 1)],
        m[(0, 2)],
        m[(1, 2)],
        m[(2, 2)],
    )
}

/// Extrinsics `[R | t]` mapping world points into the camera frame. The camera looks down +z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose::new(Matrix3::identity(), Vector3::new(0.0, 0.0, 0.0))
    }

    /// Place a camera at `center` with world-to-camera rotation `rotation`.
    pub fn from_center(rotation: Matrix3<f64>, center: Point3<f64>) -> Self {
        Pose::new(rotation, -(rotation * center.to_vec()))
    }

    /// Project a point from the world into the camera coordinate system.
    pub fn transform(&self, p: Point3<f64>) -> Point3<f64> {
        Point3::from_vec(self.rotation * p.to_vec() + self.translation)
    }

    /// Depth of a world point along this camera's optical axis.
    pub fn depth(&self, p: Point3<f64>) -> f64 {
        self.transform(p).z
    }

    /// Center of the camera in world coordinates.
    pub fn center(&self) -> Point3<f64> {
        Point3::from_vec(-(self.rotation.transpose() * self.translation))
    }

    /// Apply a motion expressed in this camera's frame: `x_new = R_rel * x_self + t_rel`.
    pub fn compose(&self, relative: &Pose) -> Pose {
        Pose::new(
            relative.rotation * self.rotation,
            relative.rotation * self.translation + relative.translation,
        )
    }

    /// Motion taking points from `self`'s frame into `other`'s frame.
    pub fn relative_to(&self, other: &Pose) -> Pose {
        let r = other.rotation * self.rotation.transpose();
        Pose::new(r, other.translation - r * self.translation)
    }

    /// Rotation as a Rodrigues vector followed by translation.
    pub fn to_params(&self) -> [f64; 6] {
        let r = to_rodrigues(self.rotation);
        [
            r.x,
            r.y,
            r.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn from_params(x: &[f64; 6]) -> Self {
        Pose::new(
            from_rodrigues(Vector3::new(x[0], x[1], x[2])),
            Vector3::new(x[3], x[4], x[5]),
        )
    }
}

/// Intrinsics and distortion `(k1, k2, p1, p2, k3)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParameters {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: [f64; 5],
}

impl CameraParameters {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraParameters {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
        }
    }

    pub fn with_distortion(mut self, distortion: [f64; 5]) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn focal(&self) -> (f64, f64) {
        (self.fx, self.fy)
    }

    pub fn principal_point(&self) -> Point2<f64> {
        Point2::new(self.cx, self.cy)
    }

    /// Intrinsic matrix `K`.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, 0.0, 0.0, self.fy, 0.0, self.cx, self.cy, 1.0,
        )
    }

    /// Inverse of `K`.
    pub fn k_inv(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            0.0,
            0.0,
            1.0 / self.fy,
            0.0,
            -self.cx / self.fx,
            -self.cy / self.fy,
            1.0,
        )
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|d| *d != 0.0)
    }

    /// Pinhole projection of a camera-space point to pixels. Distortion is not applied.
    pub fn project(&self, p: Point3<f64>) -> Point2<f64> {
        Point2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        )
    }

    /// Pixel to normalized image coordinates, ignoring distortion.
    pub fn normalize(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    /// Normalized image coordinates to pixels, ignoring distortion.
    pub fn denormalize(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new(p.x * self.fx + self.cx, p.y * self.fy + self.cy)
    }

    /// Apply the distortion model to normalized image coordinates.
    pub fn distort_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = p.x * p.x + p.y * p.y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        Point2::new(
            p.x * radial + 2.0 * p1 * p.x * p.y + p2 * (r2 + 2.0 * p.x * p.x),
            p.y * radial + p1 * (r2 + 2.0 * p.y * p.y) + 2.0 * p2 * p.x * p.y,
        )
    }

    /// Distorted pixel to undistorted normalized image coordinates by fixed point iteration.
    pub fn undistort_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        let d = self.normalize(p);
        if !self.has_distortion() {
            return d;
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let mut x = d;
        for _ in 0..20 {
            let r2 = x.x * x.x + x.y * x.y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * x.x * x.y + p2 * (r2 + 2.0 * x.x * x.x);
            let dy = p1 * (r2 + 2.0 * x.y * x.y) + 2.0 * p2 * x.x * x.y;
            x = Point2::new((d.x - dx) / radial, (d.y - dy) / radial);
        }
        x
    }

    /// Distorted pixel to the pixel an ideal pinhole camera would observe.
    pub fn undistort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        self.denormalize(self.undistort_normalized(p))
    }

    /// Ideal pinhole pixel to the pixel this camera observes.
    pub fn distort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        self.denormalize(self.distort_normalized(self.normalize(p)))
    }
}

/// Intrinsics plus the camera pose chain of a run.
#[derive(Debug, Clone)]
pub struct CameraData {
    pub intrinsics: CameraParameters,
    pub extrinsics: Vec<Pose>,
    /// Number of observations each pose took part in during the last bundle adjustment.
    pub extrinsics_counter: Vec<usize>,
}

impl CameraData {
    pub fn new(intrinsics: CameraParameters) -> Self {
        CameraData {
            intrinsics,
            extrinsics: Vec::new(),
            extrinsics_counter: Vec::new(),
        }
    }

    pub fn push_pose(&mut self, pose: Pose) -> PoseHandle {
        self.extrinsics.push(pose);
        self.extrinsics_counter.push(0);
        self.extrinsics.len() - 1
    }

    pub fn pose(&self, handle: PoseHandle) -> Option<&Pose> {
        self.extrinsics.get(handle)
    }

    pub fn last_pose(&self) -> Option<&Pose> {
        self.extrinsics.last()
    }

    pub fn num_poses(&self) -> usize {
        self.extrinsics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{AbsDiffEq, Deg};

    #[test]
    fn test_rodrigues_round_trip() {
        for v in &[
            Vector3::new(0.1, -0.3, 0.2),
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1e-14, 0.0, -2e-14),
            Vector3::new(0.0, 3.0, 0.0),
        ] {
            let r = from_rodrigues(*v);
            assert!(to_rodrigues(r).abs_diff_eq(v, 1e-9), "{:?}", v);
        }
    }

    #[test]
    fn test_pose_center_round_trip() {
        let r = Matrix3::from_angle_y(Deg(20.0));
        let c = Point3::new(1.0, -2.0, 0.5);
        let pose = Pose::from_center(r, c);
        assert!(pose.center().abs_diff_eq(&c, 1e-12));
        assert!(pose.transform(c).abs_diff_eq(&Point3::origin(), 1e-12));
    }

    #[test]
    fn test_compose_and_relative() {
        let a = Pose::new(
            Matrix3::from_angle_x(Deg(5.0)),
            Vector3::new(0.2, 0.0, -0.1),
        );
        let b = Pose::new(
            Matrix3::from_angle_z(Deg(-12.0)),
            Vector3::new(-1.0, 0.3, 0.4),
        );
        let rel = a.relative_to(&b);
        let b2 = a.compose(&rel);
        let p = Point3::new(0.5, 0.7, 4.0);
        assert!(b.transform(p).abs_diff_eq(&b2.transform(p), 1e-12));
    }

    #[test]
    fn test_camera_depth_is_along_optical_axis() {
        // camera at the origin looking down world +x
        let pose = Pose::new(Matrix3::from_angle_y(Deg(-90.0)), Vector3::new(0.0, 0.0, 0.0));
        let p = Point3::new(5.0, 0.0, 0.0);
        assert!((pose.depth(p) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let camera = CameraParameters::new(500.0, 510.0, 320.0, 240.0)
            .with_distortion([-0.2, 0.05, 0.001, -0.002, 0.0]);
        let ideal = Point2::new(400.0, 150.0);
        let observed = camera.distort_pixel(ideal);
        assert!(camera.undistort_pixel(observed).abs_diff_eq(&ideal, 1e-6));
    }

    #[test]
    fn test_k_inverse() {
        let camera = CameraParameters::new(500.0, 510.0, 320.0, 240.0);
        assert!((camera.k() * camera.k_inv()).abs_diff_eq(&Matrix3::identity(), 1e-12));
    }
}
