//! Linear initialisation of board poses from planar correspondences.
//!
//! Image points are first undistorted into normalized camera coordinates, so
//! the homography maps the board plane `Z = 0` directly onto the normalized
//! image plane and decomposes without an intrinsics matrix.

use crate::camera::CameraIntrinsics;
use nalgebra::{
    DMatrix, Isometry3, Matrix3, Quaternion, Rotation3, Translation3, UnitQuaternion, Vector2,
    Vector3, Vector4,
};

#[derive(thiserror::Error, Debug)]
pub enum PlanarError {
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("svd failed")]
    SvdFailed,
    #[error("degenerate homography for planar pose extraction")]
    DegenerateHomography,
    #[error("point {0} could not be undistorted")]
    Undistortion(usize),
    #[error("cannot average an empty set of poses")]
    EmptyPoseSet,
}

/// Estimates `H` such that `image ~ H · [x, y, 1]` with the direct linear transform.
pub fn dlt_homography(
    object: &[Vector2<f64>],
    image: &[Vector2<f64>],
) -> Result<Matrix3<f64>, PlanarError> {
    let n = object.len();
    if n < 4 || image.len() != n {
        return Err(PlanarError::NotEnoughPoints(n));
    }

    // At least nine rows so the thin SVD exposes the null vector.
    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);

    for (i, (pw, pi)) in object.iter().zip(image).enumerate() {
        let (x, y) = (pw.x, pw.y);
        let (u, v) = (pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(PlanarError::SvdFailed)?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(PlanarError::SvdFailed)?;
    let h = v_t.row(min_idx);

    let mut h_mat = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_mat[(r, c)] = h[3 * r + c];
        }
    }

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    Ok(h_mat)
}

/// Decomposes a board-to-normalized-image homography into the board pose in the camera frame.
pub fn pose_from_homography(h: &Matrix3<f64>) -> Result<Isometry3<f64>, PlanarError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm1 = h1.norm();
    let norm2 = h2.norm();
    if norm1 <= 1e-12 || norm2 <= 1e-12 {
        return Err(PlanarError::DegenerateHomography);
    }
    let lambda = 2.0 / (norm1 + norm2);

    let mut r1 = h1 * lambda;
    let mut r2 = h2 * lambda;
    let mut t = h3 * lambda;
    // The board must lie in front of the camera.
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    if r3.norm() <= 1e-12 {
        return Err(PlanarError::DegenerateHomography);
    }

    let r_mat = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r_mat.svd(true, true);
    let u = svd.u.ok_or(PlanarError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PlanarError::SvdFailed)?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Ok(Isometry3::from_parts(Translation3::from(t), rotation))
}

/// Board pose in the camera frame from one view of the board.
pub fn estimate_board_pose(
    camera: &CameraIntrinsics,
    object_points: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
) -> Result<Isometry3<f64>, PlanarError> {
    let object: Vec<Vector2<f64>> = object_points.iter().map(|p| p.xy()).collect();
    let normalized = pixels
        .iter()
        .enumerate()
        .map(|(i, px)| camera.undistort(px).map_err(|_| PlanarError::Undistortion(i)))
        .collect::<Result<Vec<_>, _>>()?;
    let h = dlt_homography(&object, &normalized)?;
    pose_from_homography(&h)
}

/// Arithmetic mean of translations and hemisphere-corrected quaternion mean of rotations.
pub fn average_isometries(poses: &[Isometry3<f64>]) -> Result<Isometry3<f64>, PlanarError> {
    let first = poses.first().ok_or(PlanarError::EmptyPoseSet)?;
    let n = poses.len() as f64;

    let t_avg = poses
        .iter()
        .fold(Vector3::zeros(), |acc, iso| acc + iso.translation.vector)
        / n;

    let q0 = first.rotation.coords;
    let acc = poses.iter().fold(Vector4::zeros(), |acc, iso| {
        let coords = iso.rotation.coords;
        if q0.dot(&coords) < 0.0 {
            acc - coords
        } else {
            acc + coords
        }
    });

    let rotation = if acc.norm_squared() == 0.0 {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_quaternion(Quaternion::from_vector(acc / n))
    };
    Ok(Isometry3::from_parts(Translation3::from(t_avg), rotation))
}
