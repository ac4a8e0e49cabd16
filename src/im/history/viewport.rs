//! 视口抽象与滚动锚点
//!
//! 向头部插入更早的消息后，视口偏移量需要增加锚点元素上方新增的高度，
//! 用户当前阅读的位置才不会跳动。

use crate::im::message::models::Message;

/// 消息列表视口（由 UI 层实现）
///
/// 坐标系：内容顶部为 0，向下递增；`scroll_offset` 是视口顶边在内容中的位置。
pub trait Viewport: Send {
    fn scroll_offset(&self) -> f64;

    fn set_scroll_offset(&mut self, offset: f64);

    /// 元素顶边在内容中的位置，元素未渲染时返回 None
    fn item_top(&self, key: &str) -> Option<f64>;

    /// 按最新的消息快照重新布局
    fn render(&mut self, messages: &[Message]);

    fn scroll_to_bottom(&mut self);
}

/// 滚动锚点：记录插入前最顶部元素的位置
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAnchor {
    key: String,
    top: f64,
}

impl ScrollAnchor {
    pub fn capture(viewport: &dyn Viewport, key: &str) -> Option<Self> {
        viewport.item_top(key).map(|top| Self {
            key: key.to_string(),
            top,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 按锚点元素位移量推进偏移，返回推进的距离
    pub fn restore(&self, viewport: &mut dyn Viewport) -> f64 {
        let Some(now) = viewport.item_top(&self.key) else {
            return 0.0;
        };
        let delta = now - self.top;
        if delta != 0.0 {
            let offset = viewport.scroll_offset();
            viewport.set_scroll_offset(offset + delta);
        }
        delta
    }
}

/// 视口中用于标识消息元素的 key：已确认为 id，否则为 localId
pub fn item_key(message: &Message) -> Option<String> {
    message.key().map(|k| k.as_str().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// 测试用视口：行高由消息内容长度决定
    #[derive(Debug, Default)]
    pub(crate) struct RowViewport {
        pub height: f64,
        pub offset: f64,
        pub tops: HashMap<String, f64>,
        pub content_height: f64,
    }

    impl RowViewport {
        pub fn new(height: f64) -> Self {
            Self {
                height,
                ..Self::default()
            }
        }

        pub fn row_height(message: &Message) -> f64 {
            let len = message.content.as_deref().map_or(0, str::len) as f64;
            20.0 + len
        }
    }

    impl Viewport for RowViewport {
        fn scroll_offset(&self) -> f64 {
            self.offset
        }

        fn set_scroll_offset(&mut self, offset: f64) {
            self.offset = offset;
        }

        fn item_top(&self, key: &str) -> Option<f64> {
            self.tops.get(key).copied()
        }

        fn render(&mut self, messages: &[Message]) {
            self.tops.clear();
            let mut y = 0.0;
            for msg in messages {
                if let Some(key) = item_key(msg) {
                    self.tops.insert(key, y);
                }
                y += Self::row_height(msg);
            }
            self.content_height = y;
        }

        fn scroll_to_bottom(&mut self) {
            self.offset = (self.content_height - self.height).max(0.0);
        }
    }

    #[test]
    fn restore_advances_by_height_added_above_anchor() {
        let mut vp = RowViewport::new(100.0);
        vp.tops.insert("m10".into(), 0.0);
        vp.offset = 5.0;
        let anchor = ScrollAnchor::capture(&vp, "m10").unwrap();

        vp.tops.insert("m10".into(), 130.0);
        assert_eq!(anchor.restore(&mut vp), 130.0);
        assert_eq!(vp.offset, 135.0);
    }

    #[test]
    fn missing_anchor_leaves_offset_untouched() {
        let mut vp = RowViewport::new(100.0);
        assert!(ScrollAnchor::capture(&vp, "nope").is_none());

        vp.tops.insert("a".into(), 10.0);
        vp.offset = 7.0;
        let anchor = ScrollAnchor::capture(&vp, "a").unwrap();
        vp.tops.clear();
        assert_eq!(anchor.restore(&mut vp), 0.0);
        assert_eq!(vp.offset, 7.0);
    }
}
