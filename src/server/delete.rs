//! DELETE: removes a file or an empty directory

use super::error_pages;
use super::handler::Exchange;
use super::router::Route;

use std::fs;

pub fn handle(route: &Route, ex: &mut Exchange) {
    let scope = &route.scope;
    let target = &route.fs_path;

    if scope.root().map_or(false, |root| root == *target) {
        warn!("{}: refusing to delete the document root", ex.peer);
        error_pages::apply(ex.response, 403, Some(scope));
        return;
    }

    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) => {
            debug!("{}: cannot delete {}: {}", ex.peer, target.display(), e);
            error_pages::apply(ex.response, error_pages::status_for(&e), Some(scope));
            return;
        }
    };

    let removed = if meta.is_dir() {
        fs::remove_dir(target)
    }
    else {
        fs::remove_file(target)
    };

    match removed {
        Ok(()) => {
            info!("{}: deleted {}", ex.peer, target.display());
            ex.response.set_status(204);
            ex.response.set_complete();
        },
        Err(e) => {
            warn!("{}: deleting {} failed: {}", ex.peer, target.display(), e);
            error_pages::apply(ex.response, error_pages::status_for(&e), Some(scope));
        }
    }
}
