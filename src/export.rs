//! Export of reconstructions to PLY point clouds and Bundle Adjustment in the Large problems.
//!
//! BAL cameras follow the Snavely convention: the camera looks down the negative z axis with y
//! up, and observations are measured from the principal point. Reconstructions are converted on
//! export by flipping the camera y and z axes.

use byteorder::*;
use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Vector2, Vector3};
use itertools::Itertools;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Ply, Property, PropertyDef, PropertyType, ScalarType,
};
use ply_rs::writer::Writer;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;

use crate::camera::{to_rodrigues, CameraData};
use crate::error::{Error, Result};
use crate::point_cloud::PointCloud;

const CAMERA_COLOR: [u8; 3] = [255, 0, 0];
const POINT_COLOR: [u8; 3] = [0, 255, 0];

/// Camera expressed as Rx+t with a single focal length and two radial distortion terms.
#[derive(Debug, Clone, PartialEq)]
pub struct SnavelyCamera {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Focal length, then the `r^2` and `r^4` distortion coefficients.
    pub intrinsics: Vector3<f64>,
}

impl SnavelyCamera {
    pub fn to_vec(&self) -> Vec<f64> {
        let r = to_rodrigues(self.rotation);
        vec![
            r.x,
            r.y,
            r.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.intrinsics.x,
            self.intrinsics.y,
            self.intrinsics.z,
        ]
    }

    pub fn project_world(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from_vec(self.rotation * p.to_vec() + self.translation)
    }

    pub fn project(&self, p: Point3<f64>) -> Point2<f64> {
        let p_ = Vector2::new(-p.x / p.z, -p.y / p.z);
        let r = 1.0
            + self.intrinsics.y * p_.magnitude2()
            + self.intrinsics.z * p_.magnitude2() * p_.magnitude2();
        Point2::from_vec(self.intrinsics.x * r * p_)
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::from_vec(-(self.rotation.transpose() * self.translation))
    }
}

/// A bundle adjustment problem in BAL layout.
///
/// `vis_graph[i][j] = (k, (u, v))` means camera `i` sees point `k` at `(u, v)`.
#[derive(Debug, Clone)]
pub struct BalProblem {
    pub cameras: Vec<SnavelyCamera>,
    pub points: Vec<Point3<f64>>,
    pub vis_graph: Vec<Vec<(usize, (f64, f64))>>,
}

impl BalProblem {
    /// Convert a reconstruction. Only active points with at least one observation by a known
    /// pose are exported; observations are the undistorted pixels, so distortion is zero.
    pub fn from_reconstruction(camera_data: &CameraData, cloud: &PointCloud) -> Self {
        let intrinsics = &camera_data.intrinsics;
        let focal = 0.5 * (intrinsics.fx + intrinsics.fy);
        let flip = Matrix3::from_diagonal(Vector3::new(1.0, -1.0, -1.0));
        let cameras = camera_data
            .extrinsics
            .iter()
            .map(|pose| SnavelyCamera {
                rotation: flip * pose.rotation,
                translation: flip * pose.translation,
                intrinsics: Vector3::new(focal, 0.0, 0.0),
            })
            .collect::<Vec<_>>();

        let mut points = Vec::new();
        let mut vis_graph = vec![Vec::new(); cameras.len()];
        for (_, point) in cloud.iter_active() {
            let views = point
                .views
                .iter()
                .filter(|o| o.pose < cameras.len())
                .collect::<Vec<_>>();
            if views.is_empty() {
                continue;
            }
            let id = points.len();
            points.push(point.position);
            for o in views {
                vis_graph[o.pose].push((
                    id,
                    (o.pixel.x - intrinsics.cx, intrinsics.cy - o.pixel.y),
                ));
            }
        }

        BalProblem {
            cameras,
            points,
            vis_graph,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_observations(&self) -> usize {
        self.vis_graph.iter().map(|x| x.len()).sum()
    }

    /// Write the BAL text format.
    ///
    /// ```txt
    /// <num_cameras> <num_points> <num_observations>
    /// <camera_index> <point_index> <x> <y>   (num_observations lines)
    /// <camera>                               (9 values each: R, t, f, k1, k2)
    /// <point>                                (3 values each)
    /// ```
    pub fn write_text(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(
            &mut file,
            "{} {} {}",
            self.num_cameras(),
            self.num_points(),
            self.num_observations()
        )?;
        for (i, obs) in self.vis_graph.iter().enumerate() {
            for (p, (u, v)) in obs {
                writeln!(&mut file, "{} {} {} {}", i, p, u, v)?;
            }
        }

        for camera in &self.cameras {
            writeln!(&mut file, "{}", camera.to_vec().iter().join(" "))?;
        }

        for point in &self.points {
            writeln!(&mut file, "{} {} {}", point.x, point.y, point.z)?;
        }

        file.flush()?;
        Ok(())
    }

    /// Write the big-endian binary format. Observations are grouped per camera, each group
    /// prefixed with its length.
    pub fn write_binary(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u64::<BigEndian>(self.num_cameras() as u64)?;
        file.write_u64::<BigEndian>(self.num_points() as u64)?;
        file.write_u64::<BigEndian>(self.num_observations() as u64)?;

        for obs in self.vis_graph.iter() {
            file.write_u64::<BigEndian>(obs.len() as u64)?;
            for (p, (u, v)) in obs {
                file.write_u64::<BigEndian>(*p as u64)?;
                file.write_f64::<BigEndian>(*u)?;
                file.write_f64::<BigEndian>(*v)?;
            }
        }

        for camera in &self.cameras {
            for x in camera.to_vec().into_iter() {
                file.write_f64::<BigEndian>(x)?;
            }
        }

        for point in &self.points {
            file.write_f64::<BigEndian>(point.x)?;
            file.write_f64::<BigEndian>(point.y)?;
            file.write_f64::<BigEndian>(point.z)?;
        }

        file.flush()?;
        Ok(())
    }

    /// Write in BAL format. `.bal` -> text, `.bbal` -> binary.
    pub fn write(&self, path: &Path) -> Result<()> {
        match extension(path)? {
            "bal" => self.write_text(path),
            "bbal" => self.write_binary(path),
            ext => Err(unknown_extension(ext)),
        }
    }
}

impl std::fmt::Display for BalProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bundle Adjustment Problem with {} cameras, {} points, and {} observations",
            self.num_cameras(),
            self.num_points(),
            self.num_observations()
        )
    }
}

fn extension(path: &Path) -> Result<&str> {
    path.extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| unknown_extension(""))
}

fn unknown_extension(ext: &str) -> Error {
    Error::IOError(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("unknown file extension {:?}", ext),
    ))
}

fn vertex(p: &Point3<f64>, color: [u8; 3]) -> DefaultElement {
    let mut v = DefaultElement::new();
    v.insert("x".to_string(), Property::Float(p.x as f32));
    v.insert("y".to_string(), Property::Float(p.y as f32));
    v.insert("z".to_string(), Property::Float(p.z as f32));
    v.insert("red".to_string(), Property::UChar(color[0]));
    v.insert("green".to_string(), Property::UChar(color[1]));
    v.insert("blue".to_string(), Property::UChar(color[2]));
    v
}

/// Write a coloured point cloud plus camera centers as an ASCII PLY file. Points without colours
/// are green, cameras are red.
pub fn write_ply(
    path: &Path,
    points: &[Point3<f64>],
    colors: Option<&[[u8; 3]]>,
    cameras: &[Point3<f64>],
) -> Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    let mut element = ElementDef::new("vertex".to_string());
    for name in &["x", "y", "z"] {
        element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Float),
        ));
    }
    for name in &["red", "green", "blue"] {
        element.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(element);

    let mut vertices = cameras
        .iter()
        .map(|c| vertex(c, CAMERA_COLOR))
        .collect::<Vec<_>>();
    vertices.extend(points.iter().enumerate().map(|(i, p)| {
        let color = colors.and_then(|c| c.get(i)).cloned().unwrap_or(POINT_COLOR);
        vertex(p, color)
    }));
    ply.payload.insert("vertex".to_string(), vertices);

    let mut file = BufWriter::new(File::create(path)?);
    let writer = Writer::new();
    writer.write_ply(&mut file, &mut ply)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraParameters, Pose};
    use crate::config::FilterConfig;
    use crate::point_cloud::Observation;
    use cgmath::{AbsDiffEq, Deg};
    use tempfile::tempdir;

    fn reconstruction() -> (CameraData, PointCloud) {
        let camera = CameraParameters::new(500.0, 500.0, 320.0, 240.0);
        let mut data = CameraData::new(camera.clone());
        data.push_pose(Pose::identity());
        data.push_pose(Pose::from_center(
            Matrix3::from_angle_y(Deg(-2.0)),
            Point3::new(0.5, 0.0, 0.0),
        ));
        let mut cloud = PointCloud::new(FilterConfig::default());
        for i in 0..20 {
            let p = Point3::new(
                -1.0 + 0.1 * i as f64,
                0.5 - 0.05 * i as f64,
                5.0 + 0.1 * i as f64,
            );
            let obs = |pose: usize| Observation {
                pose,
                pixel: camera.project(data.extrinsics[pose].transform(p)),
            };
            let h = cloud.add_cloud_point(obs(0), p, [10, 20, 30]);
            cloud.register_cloud_view(h, obs(1));
        }
        (data, cloud)
    }

    #[test]
    fn test_snavely_conversion_reprojects() {
        let (data, cloud) = reconstruction();
        let bal = BalProblem::from_reconstruction(&data, &cloud);
        assert_eq!(bal.num_cameras(), 2);
        assert_eq!(bal.num_points(), 20);
        assert_eq!(bal.num_observations(), 40);
        for (camera, obs) in bal.cameras.iter().zip(&bal.vis_graph) {
            for (p, (u, v)) in obs {
                let x = camera.project(camera.project_world(&bal.points[*p]));
                assert!((x.x - u).abs() < 1e-9 && (x.y - v).abs() < 1e-9);
            }
        }
        assert!(bal.cameras[1]
            .center()
            .abs_diff_eq(&Point3::new(0.5, 0.0, 0.0), 1e-12));
    }

    #[test]
    fn test_inactive_points_are_not_exported() {
        let (data, mut cloud) = reconstruction();
        cloud.add_cloud_point(
            Observation {
                pose: 0,
                pixel: Point2::new(1.0, 1.0),
            },
            Point3::new(900.0, 0.0, 0.0),
            [0, 0, 0],
        );
        cloud.filter_cloud();
        let bal = BalProblem::from_reconstruction(&data, &cloud);
        assert_eq!(bal.num_points(), 20);
        assert_eq!(bal.num_observations(), 40);
    }

    #[test]
    fn test_text_and_binary_layout() {
        let (data, cloud) = reconstruction();
        let bal = BalProblem::from_reconstruction(&data, &cloud);
        let dir = tempdir().unwrap();
        let text = dir.path().join("scene.bal");
        let binary = dir.path().join("scene.bbal");
        bal.write(&text).unwrap();
        bal.write(&binary).unwrap();

        let contents = std::fs::read_to_string(&text).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "2 20 40");
        assert_eq!(lines.len(), 1 + 40 + 2 + 20);
        assert_eq!(lines[41].split_whitespace().count(), 9);

        let bytes = std::fs::read(&binary).unwrap();
        let mut reader = bytes.as_slice();
        assert_eq!(reader.read_u64::<BigEndian>().unwrap(), 2);
        assert_eq!(reader.read_u64::<BigEndian>().unwrap(), 20);
        assert_eq!(reader.read_u64::<BigEndian>().unwrap(), 40);
        // first camera group
        assert_eq!(reader.read_u64::<BigEndian>().unwrap(), 20);
        let header = 3 * 8;
        let groups = 2 * 8 + 40 * 3 * 8;
        assert_eq!(bytes.len(), header + groups + 2 * 9 * 8 + 20 * 3 * 8);

        assert!(bal.write(&dir.path().join("scene.txt")).is_err());
    }

    #[test]
    fn test_ply_lists_cameras_first() {
        let (data, cloud) = reconstruction();
        let dir = tempdir().unwrap();
        let path = dir.path().join("cloud.ply");
        let points = cloud.positions();
        let colors = vec![[1, 2, 3]; points.len()];
        let centers = data.extrinsics.iter().map(|p| p.center()).collect::<Vec<_>>();
        write_ply(&path, &points, Some(&colors[..]), &centers).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("ply"));
        assert!(contents.contains("element vertex 22"));
        assert!(contents.contains(" 255 0 0"));
        assert!(contents.contains(" 1 2 3"));
    }
}
